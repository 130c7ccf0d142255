//! higit CLI - drive the repository engine from a shell

use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use higit::api::{Engine, Response};
use higit::ops::{create_tag, snapshot};
use higit::transport::serve::{upload_pack, ServeOptions};
use higit::{HashAlgorithm, Repo, Signature};

#[derive(Parser)]
#[command(name = "higit")]
#[command(about = "git-compatible local repository engine")]
#[command(version)]
struct Cli {
    /// base directory holding repositories and the ssh identity
    #[arg(short, long, env = "HIGIT_HOME", default_value = ".higit")]
    base: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// prepare the base directory and ssh identity
    InitSystem,

    /// clone a remote repository
    InitRepo {
        url: String,

        /// local repository name
        name: String,

        /// github, gitlab, gitee, gitcode, selfhosted or local
        #[arg(short, long, default_value = "")]
        provider: String,
    },

    /// delete a cloned repository
    DeleteRepo {
        url: String,

        name: String,

        #[arg(short, long, default_value = "")]
        provider: String,
    },

    /// list remote branches
    Branches { url: String },

    /// list remote tags
    Tags { url: String },

    /// fetch a branch of a cloned repository
    Fetch {
        url: String,

        branch: String,
    },

    /// show commit history
    History {
        url: String,

        branch: String,

        /// number of commits to show
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,

        /// commits to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// show the public ssh key
    SshKey {
        /// replace the key pair first
        #[arg(long)]
        generate: bool,
    },

    /// list every file of a branch
    FileTree { url: String, branch: String },

    /// list one directory of a branch
    ListDir {
        url: String,

        branch: String,

        /// directory path, the top level when omitted
        #[arg(default_value = "")]
        path: String,
    },

    /// print a file from a branch
    ReadFile {
        url: String,

        branch: String,

        path: String,
    },

    /// serve upload-pack for a repository on stdin/stdout
    UploadPack { repo: PathBuf },

    /// record a directory as a commit on a branch
    Snapshot {
        /// repository path, created when missing
        repo: PathBuf,

        /// directory to record
        source: PathBuf,

        #[arg(long, default_value = "main")]
        branch: String,

        #[arg(short, long, default_value = "snapshot")]
        message: String,

        /// `Name <email>`
        #[arg(short, long)]
        author: Option<String>,
    },

    /// create an annotated tag
    Tag {
        repo: PathBuf,

        name: String,

        /// revision to tag
        #[arg(default_value = "HEAD")]
        target: String,

        #[arg(short, long, default_value = "")]
        message: String,

        #[arg(short, long)]
        author: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// print a response as JSON, reporting whether it succeeded
fn print(response: &Response) -> higit::Result<bool> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.is_ok())
}

fn run(cli: Cli) -> higit::Result<bool> {
    let base = cli.base.display().to_string();
    let engine = Engine::new();

    // engine commands need an initialized base; local repository commands do not
    let needs_system = !matches!(
        cli.command,
        Commands::InitSystem
            | Commands::UploadPack { .. }
            | Commands::Snapshot { .. }
            | Commands::Tag { .. }
    );
    if needs_system {
        let init = engine.init_system(&base);
        if !init.is_ok() {
            return print(&init);
        }
    }

    match cli.command {
        Commands::InitSystem => print(&engine.init_system(&base)),

        Commands::InitRepo {
            url,
            name,
            provider,
        } => print(&engine.init_repo(&base, &url, &name, &provider)),

        Commands::DeleteRepo {
            url,
            name,
            provider,
        } => print(&engine.delete_repo(&base, &url, &name, &provider)),

        Commands::Branches { url } => print(&engine.get_branches(&url)),

        Commands::Tags { url } => print(&engine.get_tags(&url)),

        Commands::Fetch { url, branch } => {
            let response = engine.fetch(&url, &branch, |processed, total, message| {
                if total > 0 {
                    eprintln!("{}: {}/{}", message, processed, total);
                } else {
                    eprintln!("{}: {}", message, processed);
                }
            });
            print(&response)
        }

        Commands::History {
            url,
            branch,
            count,
            offset,
        } => print(&engine.history(&url, &branch, count, offset)),

        Commands::SshKey { generate } => {
            if generate {
                print(&engine.generate_ssh_key())
            } else {
                print(&engine.get_ssh_key())
            }
        }

        Commands::FileTree { url, branch } => print(&engine.get_file_tree(&url, &branch)),

        Commands::ListDir { url, branch, path } => print(&engine.list_dir(&url, &branch, &path)),

        Commands::ReadFile { url, branch, path } => print(&engine.read_file(&url, &branch, &path)),

        Commands::UploadPack { repo } => {
            let repo = Repo::open(&repo)?;
            let mut input = BufReader::new(io::stdin().lock());
            let mut output = BufWriter::new(io::stdout().lock());
            upload_pack(&repo, &mut input, &mut output, &ServeOptions::plain())?;
            Ok(true)
        }

        Commands::Snapshot {
            repo,
            source,
            branch,
            message,
            author,
        } => {
            let repo = Repo::init(&repo, HashAlgorithm::Sha1)?;
            let id = snapshot(&repo, &source, &branch, &message, &signature(author.as_deref()))?;
            println!("{}", id);
            Ok(true)
        }

        Commands::Tag {
            repo,
            name,
            target,
            message,
            author,
        } => {
            let repo = Repo::open(&repo)?;
            let id = create_tag(&repo, &name, &target, &signature(author.as_deref()), &message)?;
            println!("{}", id);
            Ok(true)
        }
    }
}

/// `Name <email>` at the current time
fn signature(author: Option<&str>) -> Signature {
    let author = author.unwrap_or("higit <higit@localhost>");
    match author.split_once('<') {
        Some((name, email)) => Signature::now(name.trim(), email.trim_end_matches('>').trim()),
        None => Signature::now(author.trim(), ""),
    }
}
