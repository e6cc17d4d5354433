// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

pub use handlers::{
    InitOutcome, SweepOverrides, apply_overrides, exit_code, format_price, init_workspace,
    load_config, render_listings, render_status, reset_progress, starter_config, status_json,
};
