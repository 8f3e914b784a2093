//! aml-agent 命令行入口
//!
//! 用法：
//! - `aml-agent <任务描述...>`：新建任务并跑完整个工作流，打印步骤概要与判定
//! - `aml-agent --list [N]`：列出最近的任务
//! - `aml-agent --show <task_id>`：以 JSON 打印任务状态

use anyhow::{bail, Context};
use aml_agent::{agent::Agent, config::load_config, observability};
use serde_json::Map;

const USAGE: &str = "usage: aml-agent <description...> | --list [N] | --show <task_id>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = load_config(None).unwrap_or_default();
    let agent = Agent::from_config(&cfg).context("Failed to open state store")?;

    match args.first().map(String::as_str) {
        None | Some("--help") | Some("-h") => {
            println!("{}", USAGE);
        }
        Some("--list") => {
            let limit = match args.get(1) {
                Some(n) => Some(n.parse::<usize>().context("--list expects a number")?),
                None => None,
            };
            for task in agent.list_tasks(limit)? {
                println!(
                    "{}  {:<11}  {}  {}",
                    task.task_id,
                    task.status.as_str(),
                    task.updated_at,
                    task.description
                );
            }
        }
        Some("--show") => {
            let Some(task_id) = args.get(1) else {
                bail!("--show expects a task id");
            };
            if !agent.store().task_exists(task_id)? {
                bail!("task {} not found", task_id);
            }
            let state = agent.get_state(task_id)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Some(_) => {
            let description = args.join(" ");
            let (task_id, state) = agent
                .investigate(&description, Map::new())
                .await
                .context("Investigation failed")?;

            println!("Task {}", task_id);
            if let Some(summary) = &state.evaluation.steps_summary {
                println!("{}", summary);
            }
            println!(
                "Verdict: is_done={} forced_done={}",
                state.evaluation.is_done, state.evaluation.forced_done
            );
            if !state.evaluation.explanation.is_empty() {
                println!("{}", state.evaluation.explanation);
            }
        }
    }

    Ok(())
}
