#![forbid(unsafe_code)]

mod convert;
mod rows;
mod schema;
mod time;

pub(super) use convert::*;
pub(super) use rows::*;
pub(super) use schema::{SCHEMA_VERSION, install_schema, preflight_gate};
pub(super) use time::now_ms;
