//! Terminal output helpers
//!
//! Plain line-oriented output styled with `console`. Styling is dropped when
//! stdout is not a terminal or when running on CI, so logs stay readable.

mod context;
mod output;

pub use context::UiContext;
pub use output::{
    key_value, remark, section, state_label, step_error, step_error_detail, step_info, step_ok,
    step_ok_detail, step_warn, step_warn_hint,
};
