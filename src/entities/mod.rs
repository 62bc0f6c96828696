pub mod device;
pub mod fleet_schedule;
pub mod job_execution;

pub use device::Entity as Device;
pub use fleet_schedule::Entity as FleetSchedule;
pub use job_execution::Entity as JobExecution;
