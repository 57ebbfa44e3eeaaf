use std::{process::ExitCode, sync::Arc};

use chathandoff_client::{
    ClientError, Handoff, HandoffDeps, HandoffStep, HttpBackend, LaunchDispatcher, LinkCheck,
    LogNavigator, Navigator, PageVisibility, PollPhase, SessionSink, SystemNavigator,
    TokioClock, VerificationFlow,
    config::{self, HandoffConfig},
    logging::init_logging,
};
use chathandoff_core::{
    AppVariant, FileStore, KeyValueStore, LaunchPayload, Platform, PreferenceStore, Visibility,
};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "chathandoff")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the deep link a launch would fire.
    Link {
        #[arg(long)]
        variant: Option<AppVariant>,
        #[arg(long, conflicts_with = "user_agent")]
        platform: Option<Platform>,
        #[arg(long)]
        user_agent: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        text: String,
    },
    /// Read or change the remembered chat app variant.
    Pref {
        #[command(subcommand)]
        action: PrefAction,
    },
    /// Run a verification hand-off. Reads `hidden`, `visible`, `again [variant]` and `quit`
    /// lines from stdin in place of a real page.
    Verify {
        #[arg(long)]
        referral_code: Option<String>,
        #[arg(long)]
        variant: Option<AppVariant>,
        #[arg(long, conflicts_with = "user_agent")]
        platform: Option<Platform>,
        #[arg(long)]
        user_agent: Option<String>,
        /// A code from a verify link: check it once instead of starting a hand-off.
        #[arg(long)]
        verify_code: Option<String>,
        /// Log deep links instead of opening them.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PrefAction {
    Get,
    Set { variant: AppVariant },
    Clear,
}

struct StdoutSink;

impl SessionSink for StdoutSink {
    fn accept(&self, session_token: String, profile: Option<serde_json::Value>) {
        println!("verified: session token {session_token}");
        if let Some(profile) = profile {
            println!("profile: {profile}");
        }
    }
}

fn resolve_platform(platform: Option<Platform>, user_agent: Option<&str>) -> Platform {
    platform
        .or_else(|| user_agent.map(Platform::from_user_agent))
        .unwrap_or(Platform::Other)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&config::data_dir());

    let config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            error!("config load failed: {err}");
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config::store_path()));

    match run(args.command, &config, store).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    command: Command,
    config: &HandoffConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<(), ClientError> {
    match command {
        Command::Link {
            variant,
            platform,
            user_agent,
            phone,
            text,
        } => {
            let platform = resolve_platform(platform, user_agent.as_deref());
            let payload = match phone {
                Some(phone) => LaunchPayload::ChatWithNumber { phone, text },
                None => LaunchPayload::ShareText { text },
            };
            // Only resolves; nothing is opened or watched.
            let dispatcher = LaunchDispatcher::new(
                config.link_schemes.clone(),
                platform,
                config.verifier,
                PreferenceStore::new(store),
                Arc::new(LogNavigator),
                Arc::new(PageVisibility::default()),
                Arc::new(TokioClock::new()),
            );
            let (_, uri) = dispatcher.resolve(&payload, variant);
            println!("{uri}");
            Ok(())
        }
        Command::Pref { action } => {
            let prefs = PreferenceStore::new(store);
            match action {
                PrefAction::Get => match prefs.get() {
                    Some(variant) => println!("{variant}"),
                    None => println!("(none)"),
                },
                PrefAction::Set { variant } => prefs.set(variant)?,
                PrefAction::Clear => prefs.clear()?,
            }
            Ok(())
        }
        Command::Verify {
            referral_code,
            variant,
            platform,
            user_agent,
            verify_code,
            dry_run,
        } => {
            let backend = Arc::new(HttpBackend::new(
                &config.api_base_url,
                config.request_timeout(),
            )?);
            let sink: Arc<dyn SessionSink> = Arc::new(StdoutSink);

            if let Some(code) = verify_code {
                let flow = VerificationFlow::new(backend, store);
                return match flow.check_link_code(&code, sink.as_ref()).await {
                    LinkCheck::Verified => Ok(()),
                    LinkCheck::Restart => {
                        println!("code {code} is not verified; start a new verification");
                        Ok(())
                    }
                };
            }

            let navigator: Arc<dyn Navigator> = if dry_run {
                Arc::new(LogNavigator)
            } else {
                Arc::new(SystemNavigator)
            };
            let visibility = Arc::new(PageVisibility::default());
            let deps = HandoffDeps {
                backend,
                store,
                navigator,
                visibility: visibility.clone(),
                clock: Arc::new(TokioClock::new()),
                sink,
                platform: resolve_platform(platform, user_agent.as_deref()),
            };
            run_handoff(config, deps, visibility, referral_code.as_deref(), variant).await
        }
    }
}

enum Input {
    Step(HandoffStep),
    Line(Option<String>),
}

async fn run_handoff(
    config: &HandoffConfig,
    deps: HandoffDeps,
    visibility: Arc<PageVisibility>,
    referral_code: Option<&str>,
    variant: Option<AppVariant>,
) -> Result<(), ClientError> {
    let mut handoff = Handoff::start(config, deps, referral_code, variant).await?;
    println!("verification code {}", handoff.code());
    if let Some(attempt) = handoff.last_attempt() {
        println!("opened {}", attempt.uri);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        let input = {
            let step = handoff.next_step();
            tokio::select! {
                step = step => Input::Step(step),
                line = lines.next_line(), if stdin_open => Input::Line(line.ok().flatten()),
            }
        };

        match input {
            Input::Step(HandoffStep::Authenticated) => return Ok(()),
            Input::Step(HandoffStep::RestartFlow) => {
                println!("code expired; run verify again for a new one");
                return Ok(());
            }
            Input::Step(HandoffStep::ReturnToPicker) => {
                if handoff.poll_status().phase == PollPhase::GaveUp {
                    println!("stopped waiting for verification");
                    if !stdin_open {
                        return Ok(());
                    }
                    println!("type `again [personal|business]` to reopen the app and resume");
                } else {
                    println!(
                        "the chat app did not open; type `again [personal|business]` to retry"
                    );
                }
            }
            Input::Line(None) => {
                stdin_open = false;
                // Nothing but a relaunch can move a hand-off that gave up.
                if handoff.poll_status().phase == PollPhase::GaveUp {
                    return Ok(());
                }
            }
            Input::Line(Some(line)) => {
                let mut words = line.split_whitespace();
                match words.next() {
                    Some("hidden") => visibility.set(Visibility::Hidden),
                    Some("visible") => visibility.set(Visibility::Visible),
                    Some("again") => {
                        let picked = match words.next().map(str::parse::<AppVariant>) {
                            Some(Ok(variant)) => Some(variant),
                            Some(Err(err)) => {
                                warn!("{err}");
                                continue;
                            }
                            None => None,
                        };
                        let attempt = handoff.relaunch(picked);
                        println!("opened {}", attempt.uri);
                    }
                    Some("status") => {
                        let status = handoff.poll_status();
                        println!(
                            "{:?} after {} failed polls{}",
                            status.phase,
                            status.attempts_made,
                            if status.slow_hint {
                                " (taking longer than expected)"
                            } else {
                                ""
                            }
                        );
                    }
                    Some("quit") => {
                        info!(code = %handoff.code(), "hand-off abandoned by user");
                        return Ok(());
                    }
                    Some(other) => warn!("unknown input {other:?}"),
                    None => {}
                }
            }
        }
    }
}
