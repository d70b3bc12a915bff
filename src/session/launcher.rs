use std::path::Path;
use std::process::Stdio;

/// Opens a claimed replay so the game starts playing it.
pub trait Launcher {
    fn launch(&self, path: &Path) -> std::io::Result<()>;
}

/// Hands the file to the desktop's default handler by running an opener
/// command with the path appended. The opener is not waited on.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    argv: Vec<String>,
}

impl SystemLauncher {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Launcher for SystemLauncher {
    fn launch(&self, path: &Path) -> std::io::Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "launcher command is empty",
            ));
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let child = cmd.spawn()?;
        tracing::debug!(program = %program, pid = ?child.id(), "launcher started");
        // Dropping the handle leaves the opener running; tokio reaps it in the background.
        drop(child);
        Ok(())
    }
}
