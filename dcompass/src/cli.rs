use std::path::PathBuf;
use structopt::StructOpt;

/// Platform-service action. Only `Run` is implemented by this crate;
/// the rest are a Windows-service integration that lives outside the
/// core resolver and is acknowledged here only so the flag parses.
#[derive(Debug, Clone, Copy, StructOpt)]
#[structopt(rename_all = "lowercase")]
pub enum ServiceAction {
    Install,
    Start,
    Stop,
    Restart,
    Remove,
    Run,
}

#[derive(Debug, StructOpt)]
#[structopt(name = "dcompass", about = "A local recursive-forwarding DNS resolver with filtering.")]
pub struct Args {
    /// Directory holding config.json and rule files. Defaults to a
    /// `data/` directory next to the executable.
    #[structopt(long)]
    pub data_dir: Option<PathBuf>,

    /// UDP/TCP listen port.
    #[structopt(long, default_value = "53")]
    pub port: u16,

    /// Windows-service integration; anything other than `run` merely
    /// prints a notice and exits, since service installation is not a
    /// collaborator this crate implements.
    #[structopt(long)]
    pub service: Option<ServiceAction>,
}

impl Args {
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from("."));
            exe_dir.join("data")
        })
    }
}
