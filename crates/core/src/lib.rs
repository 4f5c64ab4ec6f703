//! Core types for isodb
//!
//! This crate defines the foundational types shared by the backend and engine
//! crates:
//! - IsoError / IsoResult: error taxonomy of the isolation layer
//! - Value / Row: backend-neutral SQL values
//! - AccessBlocker: default-deny database access gate
//! - Settings: layered settings with override tokens
//! - Mark / DjangoDbMark: test marks and their validation
//! - FixtureName / FixtureSet: the fixture contract
//! - IsolationRequest: what a single test asks of the isolation layer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blocker;
pub mod error;
pub mod fixture;
pub mod mark;
pub mod request;
pub mod settings;
pub mod value;

pub use blocker::{AccessBlocker, BlockerGuard};
pub use error::{IsoError, IsoResult, ACCESS_BLOCKED_MESSAGE};
pub use fixture::{FixtureName, FixtureSet};
pub use mark::{DjangoDbMark, Mark, MarkValue};
pub use request::{DatabaseSelection, IsolationRequest, ALL_DATABASES, DEFAULT_DB_ALIAS};
pub use settings::{Settings, SettingsOverride, SettingsWrapper};
pub use value::{Row, Value};
