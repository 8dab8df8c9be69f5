//! Conductor CLI
//!
//! `conductor run`：启动一个 Agent，结束后把结果记录以 JSON 打印到 stdout；
//! `conductor schema`：打印结果记录的 JSON Schema。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor::config::load_config;
use conductor::core::{build_backend, AgentSpec, OrchestratorBuilder};
use conductor::memory::record_schema_json;
use conductor::observability;
use conductor::tools::EchoTool;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Multi-agent task orchestration engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single agent to completion
    Run {
        /// Agent name
        #[arg(long)]
        name: String,

        /// Step-by-step instructions; synthesized from --task-type and --param when omitted
        #[arg(long)]
        instructions: Option<String>,

        /// Task type (web_search, data_analysis, content_creation, calculation, ...)
        #[arg(long)]
        task_type: Option<String>,

        /// Task parameter as key=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Restrict the agent to these tools (comma separated)
        #[arg(long, value_delimiter = ',')]
        tools: Option<Vec<String>>,

        /// Use the offline mock backend instead of the HTTP gateway
        #[arg(long)]
        mock: bool,

        /// Extra configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stream progress events as JSON lines to stderr
        #[arg(long)]
        events: bool,
    },
    /// Print the JSON Schema of persisted agent records
    Schema,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Schema => {
            println!("{}", record_schema_json());
            Ok(())
        }
        Commands::Run {
            name,
            instructions,
            task_type,
            params,
            tools,
            mock,
            config,
            events,
        } => {
            let cfg = load_config(config).context("Failed to load configuration")?;
            observability::init(&cfg.app.log_level);

            let backend = build_backend(&cfg, mock).context("Failed to create model backend")?;
            let orchestrator = OrchestratorBuilder::from_config(&cfg, backend)
                .tool(EchoTool::new())
                .with_agent_creator()
                .build();

            if events {
                let mut rx = orchestrator.subscribe_events();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{line}");
                        }
                    }
                });
            }

            let mut spec = AgentSpec::new(name);
            spec.instructions = instructions;
            spec.task_type = task_type;
            spec.parameters = params.into_iter().collect();
            spec.tools = tools;
            let agent = orchestrator
                .spawn_agent(spec)
                .context("Failed to start agent")?;

            tokio::select! {
                status = agent.wait() => {
                    tracing::info!(agent_id = %agent.id(), status = %status, "agent finished");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("interrupted, stopping agents");
                }
            }
            orchestrator.shutdown().await;

            let run_id = orchestrator
                .records()
                .map(|store| store.run_id())
                .unwrap_or_else(Uuid::new_v4);
            let record = agent.record(run_id);
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("Failed to serialize record")?
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("query = example.com").unwrap(),
            ("query".to_string(), "example.com".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conductor", "run", "--name", "recon", "--param", "query=a", "--tools", "echo,web_search", "--mock",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { name, params, tools, mock, .. } => {
                assert_eq!(name, "recon");
                assert_eq!(params.len(), 1);
                assert_eq!(tools.unwrap(), vec!["echo", "web_search"]);
                assert!(mock);
            }
            Commands::Schema => panic!("expected run"),
        }
    }
}
