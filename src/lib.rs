//! Apsis - Device Fleet Credential Rotation Service
//!
//! This library provides the core functionality for the Apsis rotation
//! service. It exposes all modules for testing purposes.

pub mod credential_provider;
pub mod entities;
pub mod errors;
pub mod fleet_sync;
pub mod jobs;
pub mod notify;
pub mod rotation;
pub mod secret_cache;
pub mod settings;
pub mod storage;
pub mod web;
