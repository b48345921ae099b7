mod core;
mod follow_ui;

pub use core::{
    cancel_deployment, create_deployment, delete_deployment, execute_deployment, list_deployments,
    rollback_deployment, show_deployment, show_logs, CreateOptions,
};
