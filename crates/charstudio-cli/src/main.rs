use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use charstudio_contracts::events::EventWriter;
use charstudio_contracts::models::{ModelRegistry, ModelSelector};
use charstudio_contracts::progress::{ProgressSink, ProgressUpdate};
use charstudio_contracts::Genre;
use charstudio_engine::background::BorderFloodRemover;
use charstudio_engine::local::LocalBackend;
use charstudio_engine::supabase::{SupabaseBackend, SupabaseConfig};
use charstudio_engine::synthesis::{
    DryrunTransport, HttpInferenceTransport, InferenceTransport, SynthesisClient, SynthesisConfig,
};
use charstudio_engine::{Backend, Catalog, PoseRequest, PoseStudio, ReferenceImage};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "charstudio", version, about = "Character pose studio")]
struct Cli {
    /// Where accounts, rows and images live.
    #[arg(long, global = true, value_enum, default_value_t = BackendKind::Local)]
    backend: BackendKind,
    /// Session, local catalog and event log directory.
    #[arg(long, global = true, default_value = ".charstudio")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Local,
    Supabase,
}

#[derive(Debug, Subcommand)]
enum Command {
    Signup(CredentialArgs),
    Signin(CredentialArgs),
    Signout,
    Whoami,
    #[command(subcommand)]
    Character(CharacterCommand),
    #[command(subcommand)]
    Pose(PoseCommand),
}

#[derive(Debug, Parser)]
struct CredentialArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
}

#[derive(Debug, Subcommand)]
enum CharacterCommand {
    Add {
        #[arg(long)]
        name: String,
        /// Reference image (png, jpg, webp, gif, bmp; at most 5 MB).
        #[arg(long)]
        image: Option<PathBuf>,
    },
    Edit {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    Delete {
        #[arg(long)]
        id: String,
    },
    List,
}

#[derive(Debug, Subcommand)]
enum PoseCommand {
    Generate(GenerateArgs),
    List,
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Save a pose image as `<pose name>.png`.
    Download {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    character: String,
    #[arg(long)]
    genre: Genre,
    #[arg(long)]
    description: String,
    /// Skip background removal.
    #[arg(long)]
    keep_background: bool,
    /// Render placeholder images locally instead of calling the inference API.
    #[arg(long)]
    dryrun: bool,
    /// Model to try first.
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "charstudio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("charstudio error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let backend = open_backend(cli.backend, &cli.state_dir)?;
    match cli.command {
        Command::Signup(args) => {
            match backend.identity.sign_up(&args.email, &args.password)? {
                Some(session) => println!("signed up and signed in as {}", session.user_id()),
                None => println!("check {} for a confirmation link", args.email.trim()),
            }
            Ok(0)
        }
        Command::Signin(args) => {
            let session = backend.identity.sign_in(&args.email, &args.password)?;
            println!("signed in as {}", session.user_id());
            Ok(0)
        }
        Command::Signout => {
            backend.identity.sign_out()?;
            println!("signed out");
            Ok(0)
        }
        Command::Whoami => match backend.identity.current_session()? {
            Some(session) => {
                let email = session.user.email.as_deref().unwrap_or("-");
                println!("{} {email}", session.user_id());
                Ok(0)
            }
            None => {
                println!("not signed in");
                Ok(1)
            }
        },
        Command::Character(command) => run_character(Catalog::new(backend), command),
        Command::Pose(command) => run_pose(Catalog::new(backend), &cli.state_dir, command),
    }
}

fn open_backend(kind: BackendKind, state_dir: &Path) -> Result<Backend> {
    match kind {
        BackendKind::Local => {
            let local = LocalBackend::open(state_dir)?;
            Ok(Backend::from_shared(Arc::new(local)))
        }
        BackendKind::Supabase => {
            let config = SupabaseConfig::from_env()?;
            let remote = SupabaseBackend::new(config, state_dir.join("supabase-session.json"));
            Ok(Backend::from_shared(Arc::new(remote)))
        }
    }
}

fn run_character(catalog: Catalog, command: CharacterCommand) -> Result<i32> {
    match command {
        CharacterCommand::Add { name, image } => {
            let reference = load_reference(image.as_deref())?;
            let character = catalog.create_character(&name, reference.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&character)?);
        }
        CharacterCommand::Edit { id, name, image } => {
            let reference = load_reference(image.as_deref())?;
            let character = catalog.update_character(&id, &name, reference.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&character)?);
        }
        CharacterCommand::Delete { id } => {
            catalog.delete_character(&id)?;
            println!("deleted character {id} and its poses");
        }
        CharacterCommand::List => {
            let characters = catalog.list_characters()?;
            println!("{}", serde_json::to_string_pretty(&characters)?);
        }
    }
    Ok(0)
}

fn run_pose(catalog: Catalog, state_dir: &Path, command: PoseCommand) -> Result<i32> {
    match command {
        PoseCommand::Generate(args) => return run_generate(catalog, state_dir, args),
        PoseCommand::List => {
            let poses = catalog.list_poses()?;
            println!("{}", serde_json::to_string_pretty(&poses)?);
        }
        PoseCommand::Delete { id } => {
            catalog.delete_pose(&id)?;
            println!("deleted pose {id}");
        }
        PoseCommand::Download { id, out } => {
            let (file_name, bytes) = catalog.download_pose(&id)?;
            fs::create_dir_all(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let target = out.join(file_name);
            fs::write(&target, &bytes)
                .with_context(|| format!("failed to write {}", target.display()))?;
            println!("{}", target.display());
        }
    }
    Ok(0)
}

fn run_generate(catalog: Catalog, state_dir: &Path, args: GenerateArgs) -> Result<i32> {
    let (provider, transport, config): (&str, Box<dyn InferenceTransport>, SynthesisConfig) =
        if args.dryrun {
            (
                "dryrun",
                Box::new(DryrunTransport::default()),
                SynthesisConfig::new("dryrun"),
            )
        } else {
            (
                "huggingface",
                Box::new(HttpInferenceTransport::new()),
                SynthesisConfig::from_env()?,
            )
        };
    let chain = ModelSelector::new(Some(ModelRegistry::new(None)))
        .chain(args.model.as_deref(), provider)
        .map_err(anyhow::Error::msg)?;
    if let Some(reason) = chain.fallback_reason.as_deref() {
        tracing::warn!("{reason}");
    }
    tracing::info!(models = ?chain.names(), provider, "model chain");

    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| state_dir.join("events.jsonl"));
    let studio = PoseStudio::new(
        catalog,
        SynthesisClient::from_chain(config, transport, &chain),
        Box::new(BorderFloodRemover::default()),
    )
    .with_events(EventWriter::new(&events_path, "cli"));

    let request = PoseRequest {
        character_id: args.character,
        genre: args.genre,
        description: args.description,
        remove_background: !args.keep_background,
    };
    let mut progress = StderrProgress::default();
    let pose = studio.generate(&request, &mut progress)?;
    println!("{}", serde_json::to_string_pretty(&pose)?);
    Ok(0)
}

fn load_reference(path: Option<&Path>) -> Result<Option<ReferenceImage>> {
    path.map(|path| {
        ReferenceImage::from_path(path)
            .with_context(|| format!("cannot use {} as reference image", path.display()))
    })
    .transpose()
}

/// Prints a line per whole-percent change.
#[derive(Default)]
struct StderrProgress {
    last_printed: Option<u32>,
}

impl ProgressSink for StderrProgress {
    fn report(&mut self, update: &ProgressUpdate) {
        let percent = update.percent.round() as u32;
        if self.last_printed == Some(percent) {
            return;
        }
        self.last_printed = Some(percent);
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{percent:>3}%] {}", update.message);
    }
}
