use std::sync::Arc;

use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnwerk::{
    providers::scripted::ScriptedProvider, AppConfig, ChannelApproval, LLMProvider,
    SessionManager,
};

#[derive(Parser)]
#[command(name = "turnwerk-chat")]
#[command(about = "Chat with a turnwerk agent in the terminal")]
struct Args {
    /// Catalogue name of the agent to start with
    #[arg(short, long, default_value = "Simple Chat")]
    agent: String,

    /// Answer every turn with a canned reply instead of calling Groq
    #[arg(long)]
    scripted: bool,

    /// Ask before running tools for agents of the react_human type
    #[arg(long)]
    confirm_tools: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,turnwerk=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let models = if args.scripted {
        let provider: Arc<dyn LLMProvider> =
            Arc::new(ScriptedProvider::new().with_fallback("This is a scripted reply."));
        config.models_with(provider)
    } else {
        config.models()?
    };
    let tools = config.tools()?;
    let catalog = config.catalog(&models)?;

    let (approval, mut approvals) = ChannelApproval::new(1);
    let mut engine = config.engine(models, tools);
    if args.confirm_tools {
        engine = engine.with_approval(Arc::new(approval));
    }

    let mut sessions = SessionManager::new(Arc::new(engine), catalog);
    sessions.open(&args.agent)?;

    let mut stdout = io::stdout();
    let mut lines = BufReader::new(io::stdin()).lines();
    print_banner(&sessions);

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" | "/exit" => break,
            "/agents" => {
                for (key, agent) in sessions.catalog().list() {
                    println!("{} {key} ({})", agent.icon, agent.topology);
                }
                continue;
            }
            _ => {}
        }
        if let Some(target) = line.strip_prefix("/switch ") {
            match sessions.switch(target.trim()).map(|_| ()) {
                Ok(_) => print_banner(&sessions),
                Err(error) => eprintln!("{error}"),
            }
            continue;
        }

        let turn = sessions.send(line);
        tokio::pin!(turn);
        let outcome = loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                Some(pending) = approvals.recv() => {
                    for call in &pending.request.tool_calls {
                        println!("tool request: {}({})", call.name(), call.function.arguments);
                    }
                    stdout.write_all(b"approve? [y/N] ").await?;
                    stdout.flush().await?;
                    let answer = lines.next_line().await?.unwrap_or_default();
                    if answer.trim().eq_ignore_ascii_case("y") {
                        pending.approve();
                    } else {
                        pending.reject("declined in terminal");
                    }
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                println!("{}", outcome.reply);
                if !outcome.collected_info.is_empty() {
                    println!("-- information collected --");
                    for info in &outcome.collected_info {
                        println!("  {info}");
                    }
                }
            }
            Err(error) => eprintln!("error: {error}"),
        }
    }

    Ok(())
}

fn print_banner(sessions: &SessionManager) {
    let Some(key) = sessions.current_key() else {
        return;
    };
    if let Ok(agent) = sessions.catalog().get(key) {
        println!(
            "{} {key} [{} on {}] (/agents, /switch <name>, /quit)",
            agent.icon, agent.topology, agent.model_id
        );
    }
}
