//! CLI command implementations.
//!
//! | Module     | Commands handled                    |
//! |------------|-------------------------------------|
//! | `workflow` | `Validate`, `Plan`                  |
//! | `run`      | `Status`, `Checkpoints`, `Budget`   |
//! | `config`   | `Config`                            |

pub mod config;
pub mod run;
pub mod workflow;

pub use config::cmd_config;
pub use run::{cmd_budget, cmd_checkpoints, cmd_status};
pub use workflow::{cmd_plan, cmd_validate};
