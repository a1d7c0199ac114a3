use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vox_persona_core::config::{Config, LoggingConfig};
use vox_persona_core::instruction::compose_system_instruction;
use vox_persona_core::types::{AgentConfig, KnowledgeFile, Voice};

mod talk;

#[derive(Parser)]
#[command(
    name = "vox-persona",
    about = "Talk to a configurable voice persona over a live model API",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold a live voice conversation with the persona
    Talk {
        #[command(flatten)]
        persona: PersonaArgs,

        /// WAV file (16 kHz) streamed as the microphone
        #[arg(long)]
        input: Option<PathBuf>,

        /// Write everything the agent says to this WAV file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Use the default microphone and speakers
        #[arg(long)]
        mic: bool,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Print the system instruction the persona would be given
    Instruction {
        #[command(flatten)]
        persona: PersonaArgs,
    },

    /// List the available voices
    Voices,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct PersonaArgs {
    /// Persona name
    #[arg(long)]
    name: Option<String>,

    /// Voice (see `voices`)
    #[arg(long)]
    voice: Option<String>,

    /// System instruction
    #[arg(long)]
    instruction: Option<String>,

    /// Knowledge-base text file (repeatable, attached in order)
    #[arg(short, long = "knowledge")]
    knowledge: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config.logging(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Config loaded");

    match cli.command {
        Commands::Talk {
            persona,
            input,
            record,
            mic,
            seconds,
        } => {
            let (agent, files) = resolve_persona(&config, &persona)?;
            let options = talk::TalkOptions {
                input,
                record,
                mic,
                seconds,
            };
            talk::run(&config, agent, files, options).await?;
        }
        Commands::Instruction { persona } => {
            let (agent, files) = resolve_persona(&config, &persona)?;
            println!(
                "{}",
                compose_system_instruction(&agent.system_instruction, &files)
            );
        }
        Commands::Voices => {
            for voice in Voice::ALL {
                let marker = if voice == Voice::default() { " (default)" } else { "" };
                println!("{voice}{marker}");
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("  WARN: {w}");
                }
                for e in &errors {
                    println!("  ERROR: {e}");
                }
                if errors.is_empty() {
                    println!("Config is valid ({} warnings)", warnings.len());
                } else {
                    anyhow::bail!("{} config errors", errors.len());
                }
            }
        },
    }

    Ok(())
}

/// Persona from config, overridden by flags. Knowledge files from config come
/// first, then those given on the command line.
fn resolve_persona(
    config: &Config,
    args: &PersonaArgs,
) -> anyhow::Result<(AgentConfig, Vec<KnowledgeFile>)> {
    let mut agent = config.agent();
    if let Some(name) = &args.name {
        agent.name = name.clone();
    }
    if let Some(voice) = &args.voice {
        agent.voice = voice.parse()?;
    }
    if let Some(instruction) = &args.instruction {
        agent.system_instruction = instruction.clone();
    }

    let files = config
        .knowledge_files()
        .iter()
        .chain(args.knowledge.iter())
        .map(|path| {
            KnowledgeFile::load(path)
                .with_context(|| format!("reading knowledge file {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok((agent, files))
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let mut directives = if verbose {
        "debug".to_string()
    } else {
        config.level.clone().unwrap_or_else(|| "info".to_string())
    };
    for filter in &config.filters {
        directives.push(',');
        directives.push_str(filter);
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let to_stdout = config.output == "stdout";
    match (config.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).init(),
        (_, true) => builder.with_writer(std::io::stdout).init(),
        (_, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona(voice: Option<&str>, knowledge: Vec<PathBuf>) -> PersonaArgs {
        PersonaArgs {
            name: Some("Sophie".into()),
            voice: voice.map(String::from),
            instruction: None,
            knowledge,
        }
    }

    #[test]
    fn test_cli_parses_talk() {
        let cli = Cli::try_parse_from([
            "vox-persona",
            "talk",
            "--voice",
            "puck",
            "-k",
            "a.txt",
            "-k",
            "b.txt",
            "--input",
            "in.wav",
        ])
        .unwrap();
        match cli.command {
            Commands::Talk { persona, input, .. } => {
                assert_eq!(persona.voice.as_deref(), Some("puck"));
                assert_eq!(persona.knowledge.len(), 2);
                assert_eq!(input, Some(PathBuf::from("in.wav")));
            }
            _ => panic!("expected talk"),
        }
    }

    #[test]
    fn test_resolve_persona_overrides_and_orders_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("pricing.txt");
        let second = dir.path().join("faq.txt");
        std::fs::write(&first, "Basic: $10").unwrap();
        std::fs::write(&second, "Open 9-5").unwrap();

        let config = Config::default();
        let (agent, files) =
            resolve_persona(&config, &persona(Some("Charon"), vec![first, second])).unwrap();
        assert_eq!(agent.name, "Sophie");
        assert_eq!(agent.voice, Voice::Charon);
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["pricing.txt", "faq.txt"]);
    }

    #[test]
    fn test_resolve_persona_rejects_unknown_voice() {
        let config = Config::default();
        assert!(resolve_persona(&config, &persona(Some("Sophie"), vec![])).is_err());
    }
}
