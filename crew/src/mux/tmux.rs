//! tmux-backed [`Multiplexer`] implementation.
//!
//! Every operation shells out to the `tmux` client binary. tmux owns the
//! worker processes; this adapter never waits on them directly.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::{Multiplexer, PaneId};

/// Adapter over the `tmux` CLI.
#[derive(Debug, Clone)]
pub struct TmuxMux {
    binary: String,
}

impl TmuxMux {
    pub fn new() -> Self {
        TmuxMux {
            binary: "tmux".to_string(),
        }
    }

    /// Use an alternative client binary (e.g. an absolute path).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        TmuxMux {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "tmux");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .with_context(|| format!("spawn {} {:?}", self.binary, args))?;
        if !output.status.success() {
            return Err(anyhow!(
                "tmux {:?} failed with status {:?}: {}",
                args,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxMux {
    fn default() -> Self {
        TmuxMux::new()
    }
}

impl Multiplexer for TmuxMux {
    fn split_pane(&self, window: &str, workdir: &Path, command: Option<&str>) -> Result<PaneId> {
        let workdir = workdir.to_string_lossy().into_owned();
        let mut args = vec![
            "split-window",
            "-t",
            window,
            "-c",
            &workdir,
            "-P",
            "-F",
            "#{pane_id}",
        ];
        if let Some(command) = command {
            args.push(command);
        }
        let stdout = self.run(&args)?;
        parse_pane_id(&stdout)
    }

    fn capture_pane(&self, pane: &PaneId) -> Result<String> {
        self.run(&["capture-pane", "-p", "-t", pane.as_str()])
    }

    fn send_literal(&self, pane: &PaneId, text: &str) -> Result<()> {
        self.run(&["send-keys", "-t", pane.as_str(), "-l", text])?;
        Ok(())
    }

    fn send_enter(&self, pane: &PaneId) -> Result<()> {
        self.run(&["send-keys", "-t", pane.as_str(), "Enter"])?;
        Ok(())
    }

    fn send_interrupt(&self, pane: &PaneId) -> Result<()> {
        self.run(&["send-keys", "-t", pane.as_str(), "C-c"])?;
        Ok(())
    }

    fn select_layout(&self, window: &str, layout: &str) -> Result<()> {
        self.run(&["select-layout", "-t", window, layout])?;
        Ok(())
    }

    fn resize_pane(&self, pane: &PaneId, width_percent: u8) -> Result<()> {
        let width = format!("{width_percent}%");
        self.run(&["resize-pane", "-t", pane.as_str(), "-x", &width])?;
        Ok(())
    }

    fn select_pane(&self, pane: &PaneId) -> Result<()> {
        self.run(&["select-pane", "-t", pane.as_str()])?;
        Ok(())
    }

    fn kill_pane(&self, pane: &PaneId) -> Result<()> {
        self.run(&["kill-pane", "-t", pane.as_str()])?;
        Ok(())
    }

    fn in_copy_mode(&self, pane: &PaneId) -> Result<bool> {
        let stdout = self.run(&[
            "display-message",
            "-p",
            "-t",
            pane.as_str(),
            "#{pane_in_mode}",
        ])?;
        Ok(parse_flag(&stdout))
    }
}

fn parse_pane_id(stdout: &str) -> Result<PaneId> {
    let id = stdout.trim();
    if id.is_empty() {
        return Err(anyhow!("tmux split-window returned no pane id"));
    }
    Ok(PaneId::new(id))
}

fn parse_flag(stdout: &str) -> bool {
    stdout.trim() == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pane_id_parsing_trims_newline() {
        let pane = parse_pane_id("%12\n").expect("pane id");
        assert_eq!(pane.as_str(), "%12");
        assert!(parse_pane_id("  \n").is_err());
    }

    #[test]
    fn copy_mode_flag_parsing() {
        assert!(parse_flag("1\n"));
        assert!(!parse_flag("0\n"));
        assert!(!parse_flag(""));
    }
}
