use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "farmhand")]
#[command(about = "Dispatch render jobs to GPU workers through an object store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a job and print its id
    Submit(SubmitArgs),

    /// Show the status of one job, or of every locally recorded job
    Status(StatusArgs),

    /// Block until a job completes or the timeout elapses
    Wait(WaitArgs),

    /// Download a job's results into the output directory
    Download(DownloadArgs),

    /// List locally recorded jobs, newest first
    List,

    /// Run the GPU-host worker loop
    Worker,

    /// Run the HTTP job API
    Serve(ServeArgs),

    /// Move stale processing manifests back to the pending queue
    Reap(ReapArgs),
}

#[derive(clap::Args, Debug)]
pub struct SubmitArgs {
    /// Job kind: render or character
    #[arg(long)]
    pub kind: String,

    /// Script path relative to the local scripts directory
    #[arg(long)]
    pub script: String,

    /// Character names to render (render jobs)
    #[arg(long, value_delimiter = ',')]
    pub characters: Vec<String>,

    /// Output subdirectory name
    #[arg(long, default_value = "renders")]
    pub output: String,

    /// Tool parameter override, KEY=VALUE (repeatable)
    #[arg(long = "param")]
    pub params: Vec<String>,

    /// Store-relative asset path to stage on the worker (repeatable)
    #[arg(long = "asset")]
    pub assets: Vec<String>,

    /// Block until the job completes
    #[arg(long)]
    pub wait: bool,
}

#[derive(clap::Args, Debug)]
pub struct StatusArgs {
    /// Job id; omit to list the status of every recorded job
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct WaitArgs {
    /// Job id
    #[arg(long)]
    pub id: String,

    /// Timeout in seconds (default from configuration)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Job id
    #[arg(long)]
    pub id: String,

    /// Destination directory (default from configuration)
    #[arg(long)]
    pub dest: Option<PathBuf>,

    /// Overwrite an existing local copy of the results
    #[arg(long)]
    pub force: bool,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the API server to (default from configuration)
    #[arg(long)]
    pub address: Option<SocketAddr>,
}

#[derive(clap::Args, Debug)]
pub struct ReapArgs {
    /// Requeue processing manifests older than this many seconds
    #[arg(long = "older-than")]
    pub older_than_secs: u64,
}
