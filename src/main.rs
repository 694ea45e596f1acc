use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};

use mindflow::computer::Approver;
use mindflow::search::{SearcherRegistry, SearxSearcher};
use mindflow::{AgentConfig, AgentController, AgentError, Computer, OllamaBackend};

#[derive(Debug, Parser)]
#[command(
    name = "mindflow",
    version,
    about = "Chat with a local LLM that can run code on this computer"
)]
struct Cli {
    /// Model served by Ollama.
    #[arg(long, env = "MINDFLOW_MODEL", default_value = "llama3.2")]
    model: String,

    /// Ollama base URL.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    ollama_url: String,

    /// SearxNG base URL; web search is off without it.
    #[arg(long, env = "MINDFLOW_SEARX_URL")]
    searx_url: Option<String>,

    /// Code execution rounds allowed per message.
    #[arg(long, default_value_t = 16)]
    max_rounds: usize,

    /// Per-execution timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Ask before running each code block.
    #[arg(long)]
    no_auto_run: bool,

    /// Never classify messages or search the web.
    #[arg(long)]
    no_search: bool,

    /// Echo every unit sent to the model.
    #[arg(long)]
    verbose: bool,

    /// Export spans to this OTLP collector.
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Answer a single message and exit.
    #[arg(long, short)]
    message: Option<String>,

    /// Print Prometheus metrics on exit.
    #[arg(long)]
    print_metrics: bool,
}

impl Cli {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            max_rounds: self.max_rounds,
            execution_timeout_secs: self.timeout,
            auto_run: !self.no_auto_run,
            search_enabled: !self.no_search && self.searx_url.is_some(),
            verbose: self.verbose,
            ..AgentConfig::default()
        }
    }
}

/// Asks on the terminal before a block runs
struct TerminalApprover;

#[async_trait]
impl Approver for TerminalApprover {
    async fn approve(&self, _format: &str, _code: &str) -> bool {
        let answer = tokio::task::spawn_blocking(|| {
            print!("  Run this code? (y/n) ");
            std::io::stdout().flush().ok()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).ok()?;
            Some(line)
        })
        .await;

        matches!(answer, Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y"))
    }
}

async fn read_line() -> anyhow::Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        let n = std::io::stdin().lock().read_line(&mut line)?;
        Ok::<_, std::io::Error>((n > 0).then_some(line))
    })
    .await
    .context("stdin reader task failed")?
    .context("failed to read from stdin")
}

/// Run one turn, cancelling it on Ctrl-C. Returns true when the
/// conversation should end.
async fn turn(agent: &mut AgentController, message: &str) -> bool {
    let token = agent.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let result = agent.chat(message).await;
    watcher.abort();
    agent.renew_cancellation();

    match result {
        Ok(answer) => {
            if let Some(reason) = &answer.classification_error {
                warn!(%reason, "answered without web search");
            }
            println!("\n{}\n", answer.final_response);
            answer.conversation_over
        }
        Err(AgentError::BudgetExceeded { max_rounds }) => {
            println!("\nThe agent gave up after {max_rounds} rounds without an answer.\n");
            false
        }
        Err(AgentError::Cancelled { rounds }) => {
            println!("\nCancelled after {rounds} rounds.\n");
            false
        }
        Err(e) => {
            eprintln!("\nerror: {e}\n");
            false
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    mindflow::tracing::init_tracing("mindflow", cli.otlp_endpoint.as_deref())
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to initialize tracing")?;

    let config = cli.agent_config();
    let backend = Arc::new(OllamaBackend::new(&cli.ollama_url, &config.model));

    let mut computer = Computer::new(
        &config.python_command,
        Duration::from_secs(config.execution_timeout_secs),
    );
    if !config.auto_run {
        computer = computer.with_approver(Arc::new(TerminalApprover));
    }

    let mut searchers = SearcherRegistry::new();
    if let Some(url) = &cli.searx_url {
        searchers.register(Arc::new(SearxSearcher::new(url)));
    }

    let mut agent = AgentController::new(backend, computer, config).with_searchers(searchers);
    info!(
        session_id = agent.session_id(),
        model = %cli.model,
        search = agent.config().search_enabled,
        "session started"
    );

    if let Some(message) = &cli.message {
        turn(&mut agent, message).await;
    } else {
        println!("MindFlow ({}). Type `exit` or press Ctrl-D to quit.\n", cli.model);
        while let Some(line) = read_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" || line == "quit" {
                break;
            }
            if turn(&mut agent, line).await {
                break;
            }
        }
    }

    agent.shutdown().await;

    if cli.print_metrics {
        print!("{}", mindflow::metrics::gather_text());
    }
    mindflow::tracing::shutdown_tracing();
    Ok(())
}
