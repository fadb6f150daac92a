//! Async client for a FatFractal-style REST resource backend.
//!
//! # Overview
//! Schemaless objects live in collections under `ff/resources/` and are
//! addressed by a locator (`ffUrl`). [`ResourceClient`] creates, reads,
//! updates and deletes them, keeps an identity-preserving cache keyed by
//! locator, resolves `ffRefs` references to other objects and blobs, and
//! manages the login session.
//!
//! # Design
//! - The client builds plain [`HttpRequest`] values and hands them to an
//!   injected [`Transport`]; [`ReqwestTransport`] is the default, tests use a
//!   scripted one. No module-global state: each client owns its cache and
//!   session, so several backends can be used at once.
//! - [`Resource`] is a cheap shared handle. Every holder of a cached object
//!   observes merges done by later reads and writes.
//! - Wire DTOs in [`types`] are defined independently from the mock-server
//!   crate; integration tests catch schema drift.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod paths;
pub mod resource;
pub mod session;
pub mod transport;
pub mod types;

pub use client::{CacheEntry, ResourceClient, SCRIPT_AUTH_SERVICE_FACEBOOK, SCRIPT_AUTH_SERVICE_TWITTER, SDK_VERSION};
pub use config::ClientConfig;
pub use error::{ClientError, TransportError};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use resource::{Field, Metadata, Resource, ResourceState};
pub use session::{MemorySessionStore, Session, SessionStore};
pub use transport::Transport;
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
pub use types::{Envelope, GrabBagAction, Permission, Reference, ReferenceKind, RegisterRequest, Token};
