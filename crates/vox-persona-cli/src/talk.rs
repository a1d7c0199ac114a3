//! `talk` command: run one live session and render it on the terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use vox_persona_core::config::Config;
use vox_persona_core::types::{AgentConfig, KnowledgeFile, Role};
use vox_persona_live::{GeminiLiveConnector, SessionManager, SessionSettings, SessionState};
use vox_persona_media::AudioBackend;
use vox_persona_media::file::FileBackend;

pub struct TalkOptions {
    pub input: Option<PathBuf>,
    pub record: Option<PathBuf>,
    pub mic: bool,
    pub seconds: Option<u64>,
}

#[cfg(feature = "cpal")]
fn mic_backend() -> anyhow::Result<Arc<dyn AudioBackend>> {
    Ok(Arc::new(vox_persona_media::device::CpalBackend::new()))
}

#[cfg(not(feature = "cpal"))]
fn mic_backend() -> anyhow::Result<Arc<dyn AudioBackend>> {
    anyhow::bail!("--mic requires a build with the `cpal` feature")
}

fn backend(options: &TalkOptions) -> anyhow::Result<Arc<dyn AudioBackend>> {
    if options.mic {
        return mic_backend();
    }
    Ok(Arc::new(FileBackend::new(
        options.input.clone(),
        options.record.clone(),
    )))
}

pub async fn run(
    config: &Config,
    agent: AgentConfig,
    files: Vec<KnowledgeFile>,
    options: TalkOptions,
) -> anyhow::Result<()> {
    let api_key = config
        .api_key()
        .context("no API key configured (set live.api_key or GEMINI_API_KEY)")?;
    let connector = Arc::new(GeminiLiveConnector::new(api_key, Some(&config.base_url())));
    let manager = SessionManager::new(
        connector,
        backend(&options)?,
        SessionSettings::from_config(config),
    );

    let mut view = manager.subscribe();
    println!("Connecting {} ({})...", agent.name, agent.voice);
    manager.start(&agent, &files).await?;

    let deadline = async {
        match options.seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut printed = 0;
    let mut announced = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping session");
                manager.stop();
                break;
            }
            _ = &mut deadline => {
                info!("Time limit reached, stopping session");
                manager.stop();
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(e) = manager.send_text(line.trim()) {
                        warn!(error = %e, "Text turn not sent");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Reading stdin failed");
                    stdin_open = false;
                }
            },
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                for message in current.messages.iter().skip(printed) {
                    let speaker = match message.role {
                        Role::User => "you",
                        Role::Agent => agent.name.as_str(),
                    };
                    println!("[{}] {speaker}: {}", message.timestamp.format("%H:%M:%S"), message.text);
                }
                printed = current.messages.len();

                if current.state == SessionState::Active && !announced {
                    announced = true;
                    println!("Session active. Type to send text, Ctrl-C to stop.");
                }
                if current.state == SessionState::Idle {
                    if let Some(error) = current.error {
                        anyhow::bail!(error);
                    }
                    println!("Session ended.");
                    break;
                }
            }
        }
    }

    Ok(())
}
