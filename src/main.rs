//! veilfs - an encrypted overlay filesystem.
//!
//! Stores encrypted, de-identified objects in a data directory on an
//! untrusted host filesystem and exposes them through a virtual filesystem
//! surface.

use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use veilfs::fs::superblock::Superblock;
use veilfs::{Filesystem, MountOptions, OpContext, OpenFlags, RepoConfig, Result};

#[derive(Parser)]
#[command(name = "veilfs")]
#[command(author, version, about, long_about = None)]
#[command(
    about = "Encrypted overlay filesystem",
    long_about = "Stores files as opaque authenticated objects in a data directory; \
                  contents, names, and metadata are encrypted before they reach the host."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository in the given directory
    Init {
        /// Repository data directory
        data_dir: PathBuf,

        /// Plaintext block size in bytes (default: 4096)
        #[arg(long, default_value = "4096")]
        block_size: u32,
    },

    /// List a directory
    Ls {
        /// Repository data directory
        data_dir: PathBuf,

        /// Path to list (default: /)
        #[arg(default_value = "/")]
        path: String,
    },

    /// Create a directory
    Mkdir {
        /// Repository data directory
        data_dir: PathBuf,

        /// Path for the new directory
        path: String,
    },

    /// Write a file
    Write {
        /// Repository data directory
        data_dir: PathBuf,

        /// Destination path
        path: String,

        /// Input file to read from (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Read a file
    Read {
        /// Repository data directory
        data_dir: PathBuf,

        /// Path to read
        path: String,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Remove a file or empty directory
    Rm {
        /// Repository data directory
        data_dir: PathBuf,

        /// Path to remove
        path: String,
    },

    /// Show repository statistics
    Info {
        /// Repository data directory
        data_dir: PathBuf,
    },

    /// Change the repository password
    Passwd {
        /// Repository data directory
        data_dir: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init {
            data_dir,
            block_size,
        } => cmd_init(&data_dir, block_size),
        Commands::Ls { data_dir, path } => cmd_ls(&data_dir, &path),
        Commands::Mkdir { data_dir, path } => cmd_mkdir(&data_dir, &path),
        Commands::Write {
            data_dir,
            path,
            input,
        } => cmd_write(&data_dir, &path, input),
        Commands::Read {
            data_dir,
            path,
            output,
        } => cmd_read(&data_dir, &path, output),
        Commands::Rm { data_dir, path } => cmd_rm(&data_dir, &path),
        Commands::Info { data_dir } => cmd_info(&data_dir),
        Commands::Passwd { data_dir } => cmd_passwd(&data_dir),
    }
}

fn prompt_password(prompt: &str) -> String {
    rpassword::prompt_password(prompt).unwrap_or_else(|_| {
        eprint!("{}", prompt);
        io::stderr().flush().unwrap();
        let mut password = String::new();
        io::stdin().read_line(&mut password).unwrap();
        password.trim().to_string()
    })
}

fn mount(data_dir: &PathBuf, readonly: bool) -> Result<Filesystem> {
    let password = prompt_password("Password: ");
    Filesystem::mount(data_dir, &password, MountOptions { readonly })
}

fn cmd_init(data_dir: &PathBuf, block_size: u32) -> Result<()> {
    let password = prompt_password("Enter password: ");
    let confirm = prompt_password("Confirm password: ");
    if password != confirm {
        eprintln!("Passwords do not match");
        std::process::exit(1);
    }

    let fs = Filesystem::create(data_dir, &password, RepoConfig::new(block_size))?;
    println!(
        "Repository initialized at {} (block size {})",
        data_dir.display(),
        fs.block_size()
    );
    Ok(())
}

fn cmd_ls(data_dir: &PathBuf, path: &str) -> Result<()> {
    let fs = mount(data_dir, true)?;
    let dir = fs.opendir(path)?;
    for entry in fs.readdir(&dir)? {
        if entry.name == "." || entry.name == ".." {
            continue;
        }
        let marker = match entry.kind {
            veilfs::fs::FileKind::Directory => "/",
            veilfs::fs::FileKind::Symlink => "@",
            veilfs::fs::FileKind::Regular => "",
        };
        println!("{}{}", entry.name, marker);
    }
    Ok(())
}

fn cmd_mkdir(data_dir: &PathBuf, path: &str) -> Result<()> {
    let fs = mount(data_dir, false)?;
    fs.mkdir(path, 0o755, &OpContext::default())
}

fn cmd_write(data_dir: &PathBuf, path: &str, input: Option<PathBuf>) -> Result<()> {
    let mut data = Vec::new();
    match input {
        Some(p) => {
            data = std::fs::read(p)?;
        }
        None => {
            io::stdin().read_to_end(&mut data)?;
        }
    }

    let fs = mount(data_dir, false)?;
    let file = match fs.create_file(path, 0o644, &OpContext::default()) {
        Ok(f) => f,
        Err(veilfs::Error::Exists(_)) => fs.open(
            path,
            OpenFlags {
                write: true,
                truncate: true,
            },
        )?,
        Err(e) => return Err(e),
    };
    fs.write(&file, 0, &data)?;
    fs.flush(&file)?;
    println!("Wrote {} bytes to {}", data.len(), path);
    Ok(())
}

fn cmd_read(data_dir: &PathBuf, path: &str, output: Option<PathBuf>) -> Result<()> {
    let fs = mount(data_dir, true)?;
    let file = fs.open(path, OpenFlags::read_only())?;
    let size = fs.getattr(path)?.size;

    let mut data = vec![0u8; size as usize];
    let read = fs.read(&file, 0, &mut data)?;
    data.truncate(read);

    match output {
        Some(p) => std::fs::write(p, &data)?,
        None => io::stdout().write_all(&data)?,
    }
    Ok(())
}

fn cmd_rm(data_dir: &PathBuf, path: &str) -> Result<()> {
    let fs = mount(data_dir, false)?;
    match fs.getattr(path)?.kind {
        veilfs::fs::FileKind::Directory => fs.rmdir(path),
        _ => fs.unlink(path),
    }
}

fn cmd_info(data_dir: &PathBuf) -> Result<()> {
    let fs = mount(data_dir, true)?;
    let stats = fs.statfs()?;
    println!("Repository:  {}", data_dir.display());
    println!("Block size:  {} bytes", stats.block_size);
    println!("Objects:     {}", stats.object_count);
    println!("Host bytes:  {}", stats.bytes_used);
    Ok(())
}

fn cmd_passwd(data_dir: &PathBuf) -> Result<()> {
    let old = prompt_password("Current password: ");
    let mut sb = Superblock::load(data_dir, &old)?;

    let new = prompt_password("New password: ");
    let confirm = prompt_password("Confirm new password: ");
    if new != confirm {
        eprintln!("Passwords do not match");
        std::process::exit(1);
    }

    sb.change_password(&new)?;
    println!("Password changed");
    Ok(())
}
