#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod adapter;
pub mod alerts;
pub mod dispatch;
pub mod envelope;
pub mod handlers;
pub mod identity;
pub mod mention;
pub mod router;
pub mod server;
pub mod settings;
pub mod store;
pub mod util;
