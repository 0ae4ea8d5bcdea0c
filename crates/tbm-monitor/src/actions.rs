//! Node actions that run outside the site manager.
//!
//! Flashing a TelosB node and resetting it are done on the machine hosting
//! the node, over `scp` and `ssh`:
//!
//! ```text
//! scp <image> root@<host>:/var/wisenet/nodes/<gid>/imgs
//! ssh root@<host> 'cd /var/wisenet/nodes/<gid> && ./program imgs/<image>'
//! ssh root@<host> 'cd /var/wisenet/nodes/<gid> && ./reset'
//! ```
//!
//! The serial application holds the port, so it is closed for the flash and
//! reopened afterwards if it was running.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::fanout::NodeOperation;
use crate::node::Node;

/// Arguments that open the serial bridge application on a TelosB node.
pub const SERIAL_APP_ARGS: [&str; 2] = ["-b115200", "./tty"];

/// Programming and reset of nodes.
///
/// `Ok(false)` means the action ran and failed on the node side.
#[async_trait]
pub trait NodeActions: Send + Sync {
    async fn program(&self, node: &Node, image: &Path) -> Result<bool>;

    async fn reset(&self, node: &Node) -> Result<bool>;
}

// ============================================================================
// Serial Application
// ============================================================================

/// Opens the serial application.
///
/// The request is sent twice; the site manager sometimes drops the first.
pub async fn open_serial(node: &Node) -> Result<()> {
    node.start_app(SERIAL_APP_ARGS).await?;
    node.start_app(SERIAL_APP_ARGS).await
}

/// Closes the serial application, optionally waiting until pings show it
/// stopped.
pub async fn close_serial(node: &Node, wait: bool) -> Result<()> {
    node.stop_app().await?;
    if wait {
        node.block_until_app(false).await;
    }
    Ok(())
}

// ============================================================================
// TelosB
// ============================================================================

/// `NodeActions` for TelosB nodes.
#[derive(Debug, Clone)]
pub struct TelosbActions {
    user: String,
    nodes_dir: String,
    scp: OsString,
    ssh: OsString,
    quiet: bool,
}

impl Default for TelosbActions {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            nodes_dir: "/var/wisenet/nodes".to_string(),
            scp: OsString::from("scp"),
            ssh: OsString::from("ssh"),
            quiet: true,
        }
    }
}

impl TelosbActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shows the output of `scp` and `ssh` instead of discarding it.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.quiet = !verbose;
        self
    }

    /// Replaces the `scp` and `ssh` executables.
    #[must_use]
    pub fn with_tools(mut self, scp: impl Into<OsString>, ssh: impl Into<OsString>) -> Self {
        self.scp = scp.into();
        self.ssh = ssh.into();
        self
    }

    fn node_dir(&self, node: &Node) -> String {
        format!("{}/{}", self.nodes_dir, node.gid())
    }

    fn remote(&self, node: &Node, action: &str) -> Result<String> {
        if !node.kind().is_telosb() {
            return Err(action_error(
                action,
                node,
                format!("not supported for node type {}", node.descriptor().type_name),
            ));
        }
        let host = node.host().ok_or_else(|| MonitorError::NodeUnseen {
            gid: node.gid().clone(),
        })?;
        Ok(format!("{}@{host}", self.user))
    }

    /// Runs a tool to completion. `Ok(false)` on a non-zero exit.
    async fn run_tool(
        &self,
        action: &str,
        node: &Node,
        program: &OsString,
        args: Vec<OsString>,
    ) -> Result<bool> {
        let output: fn() -> Stdio = if self.quiet { Stdio::null } else { Stdio::inherit };
        debug!(node = %node, action, program = ?program, args = ?args, "Running tool");

        let status = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .status()
            .await
            .map_err(|e| action_error(action, node, format!("{}: {e}", program.to_string_lossy())))?;

        if !status.success() {
            warn!(node = %node, action, %status, "Tool failed");
        }
        Ok(status.success())
    }
}

#[async_trait]
impl NodeActions for TelosbActions {
    async fn program(&self, node: &Node, image: &Path) -> Result<bool> {
        let remote = self.remote(node, "program")?;
        let file_name = image
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| action_error("program", node, "image path has no file name"))?;
        if !image.is_file() {
            return Err(action_error(
                "program",
                node,
                format!("image {} not found", image.display()),
            ));
        }

        let serial_was_open = node.is_app_running();
        if serial_was_open {
            close_serial(node, true).await?;
        }

        let node_dir = self.node_dir(node);
        let copied = self
            .run_tool(
                "program",
                node,
                &self.scp,
                vec![
                    image.as_os_str().to_os_string(),
                    OsString::from(format!("{remote}:{node_dir}/imgs")),
                ],
            )
            .await?;
        if !copied {
            warn!(node = %node, "Failed to copy image");
            return Ok(false);
        }

        let flashed = self
            .run_tool(
                "program",
                node,
                &self.ssh,
                vec![
                    OsString::from(&remote),
                    OsString::from(format!("cd {node_dir} && ./program imgs/{file_name}")),
                ],
            )
            .await?;
        if !flashed {
            warn!(node = %node, "Failed to program image");
            return Ok(false);
        }

        if serial_was_open {
            open_serial(node).await?;
        }
        info!(node = %node, image = %file_name, "Node programmed");
        Ok(true)
    }

    async fn reset(&self, node: &Node) -> Result<bool> {
        let remote = self.remote(node, "reset")?;
        let node_dir = self.node_dir(node);
        let reset = self
            .run_tool(
                "reset",
                node,
                &self.ssh,
                vec![
                    OsString::from(remote),
                    OsString::from(format!("cd {node_dir}/ && ./reset")),
                ],
            )
            .await?;
        if reset {
            info!(node = %node, "Node reset");
        }
        Ok(reset)
    }
}

fn action_error(action: &str, node: &Node, reason: impl Into<String>) -> MonitorError {
    MonitorError::Action {
        action: action.to_string(),
        node: node.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Flashes an image, as a fan-out operation.
#[derive(Clone)]
pub struct Program {
    actions: Arc<dyn NodeActions>,
    image: PathBuf,
}

impl Program {
    pub fn new(actions: Arc<dyn NodeActions>, image: impl Into<PathBuf>) -> Self {
        Self {
            actions,
            image: image.into(),
        }
    }
}

#[async_trait]
impl NodeOperation for Program {
    type Output = bool;

    fn name(&self) -> &str {
        "program"
    }

    async fn run(&self, node: &Node) -> Result<bool> {
        self.actions.program(node, &self.image).await
    }
}

/// Resets a node, as a fan-out operation.
#[derive(Clone)]
pub struct Reset {
    actions: Arc<dyn NodeActions>,
}

impl Reset {
    pub fn new(actions: Arc<dyn NodeActions>) -> Self {
        Self { actions }
    }
}

#[async_trait]
impl NodeOperation for Reset {
    type Output = bool;

    fn name(&self) -> &str {
        "reset"
    }

    async fn run(&self, node: &Node) -> Result<bool> {
        self.actions.reset(node).await
    }
}
