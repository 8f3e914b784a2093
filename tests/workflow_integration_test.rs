//! 工作流集成测试：通过公开 API 驱动完整的规划 → 执行 → 评估

use std::sync::Arc;

use aml_agent::agent::Agent;
use aml_agent::config::AppConfig;
use aml_agent::llm::{CompletionRequest, LlmError, MockLlmClient};
use aml_agent::memory::{shallow_merge, StateStore};
use aml_agent::tools::{MockAnalysisClient, ToolDispatcher};
use aml_agent::workflow::{
    fallback_plan, ExecutionStatus, FeedbackEvent, StepExecutor, StepOutcome, TaskStatus,
    FORCED_DONE_THRESHOLD,
};
use aml_agent::AgentError;
use serde_json::{json, Map, Value};

const THREE_STEP_PLAN: &str = r#"```json
{"plan": [
  {"step_id": 1, "description": "Fetch recent transfers", "tool": "fetch_transaction", "parameters": {"limit": 5}},
  {"step_id": 2, "description": "Score counterparties", "tool": "risk_checker", "parameters": {"address": "0xabc"}},
  {"step_id": 3, "description": "Write the report", "tool": "report_generator", "parameters": {"include_evidence": true}}
]}
```"#;

fn is_evaluation(req: &CompletionRequest) -> bool {
    req.user.contains("# AML Detection Task Evaluation")
}

fn is_planning(req: &CompletionRequest) -> bool {
    req.user.contains("# Available Tools:")
}

/// 规划返回三步计划；评估始终给出 is_done=false
fn never_done_llm() -> MockLlmClient {
    MockLlmClient::with_handler(|req| {
        if is_planning(req) {
            Ok(THREE_STEP_PLAN.to_string())
        } else if is_evaluation(req) {
            Ok("```is_done\nFalse\n```\n```explanation\nMore evidence is needed.\n```".to_string())
        } else {
            Err(LlmError::Request("unexpected reasoning call".to_string()))
        }
    })
}

fn in_memory_agent(llm: Arc<MockLlmClient>) -> Agent {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    Agent::with_components(
        store,
        llm,
        None,
        Some(Arc::new(MockAnalysisClient::new())),
        &AppConfig::default(),
    )
}

#[tokio::test]
async fn test_planner_failure_falls_back_to_single_step() {
    let llm = Arc::new(MockLlmClient::new());
    let agent = in_memory_agent(llm);

    let (_task_id, state) = agent
        .investigate("Investigate address X", Map::new())
        .await
        .unwrap();

    let plan = serde_json::to_value(&state.plan).unwrap();
    assert_eq!(
        plan,
        json!([{
            "step_id": 1,
            "description": "Answer the following question: Investigate address X",
            "tool": "ai_model",
            "parameters": { "question": "Investigate address X" }
        }])
    );
    assert_eq!(state.plan, fallback_plan("Investigate address X"));

    // 推理全部失败时仍然得到终态：步骤结果为 error，评估为中性判定
    assert_eq!(state.execution.status, ExecutionStatus::Completed);
    assert!(state.execution.steps[0].result.get("error").is_some());
    assert!(!state.evaluation.is_done);
    assert_eq!(state.evaluation.is_done_false_count, 1);
    assert!(state.evaluation.explanation.starts_with("Not enough information"));
}

#[tokio::test]
async fn test_repeated_negative_verdicts_force_completion() {
    let llm = Arc::new(never_done_llm());
    let agent = in_memory_agent(llm.clone());
    let task_id = agent.start_task("Investigate address 0xabc", Map::new()).unwrap();

    let first = agent.run(&task_id).await.unwrap();
    let ids: Vec<_> = first.execution.steps.iter().map(|s| s.step_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(first.tool_calls.len(), 3);
    assert!(first.tool_calls.iter().all(|c| c.timestamp.is_some()));
    assert_eq!(first.execution.steps[2].result["evidence"].as_array().unwrap().len(), 2);
    assert!(!first.evaluation.is_done);
    assert_eq!(first.evaluation.is_done_false_count, 1);
    assert_eq!(first.task.status, TaskStatus::Started);

    let second = agent.run(&task_id).await.unwrap();
    assert!(second.evaluation.is_done);
    assert!(second.evaluation.forced_done);
    assert_eq!(second.evaluation.is_done_false_count, FORCED_DONE_THRESHOLD);
    assert_eq!(second.task.status, TaskStatus::Completed);

    let third = agent.run(&task_id).await.unwrap();
    assert!(third.evaluation.is_done);
    assert!(third.evaluation.forced_done);
    assert_eq!(third.evaluation.is_done_false_count, FORCED_DONE_THRESHOLD);

    // 计划只生成一次，步骤不重复执行
    assert_eq!(third.execution.steps.len(), 3);
    let planning_calls = llm.requests().iter().filter(|r| is_planning(r)).count();
    assert_eq!(planning_calls, 1);
    let evaluation_calls = llm.requests().iter().filter(|r| is_evaluation(r)).count();
    assert_eq!(evaluation_calls, 3);

    let stored = agent.store().load(&task_id).unwrap();
    assert_eq!(stored.evaluation, third.evaluation);
}

#[tokio::test]
async fn test_positive_verdict_resets_counter() {
    let llm = Arc::new(MockLlmClient::with_handler(|req| {
        if is_planning(req) {
            Ok(THREE_STEP_PLAN.to_string())
        } else {
            Ok("```is_done\ntrue\n```\n```explanation\nRisk is medium.\n```".to_string())
        }
    }));
    let agent = in_memory_agent(llm);
    let (_id, state) = agent.investigate("Check 0xabc", Map::new()).await.unwrap();
    assert!(state.evaluation.is_done);
    assert!(!state.evaluation.forced_done);
    assert_eq!(state.evaluation.is_done_false_count, 0);
    assert_eq!(state.evaluation.extra["risk_level"], json!("medium"));
    assert!(state
        .evaluation
        .steps_summary
        .as_deref()
        .unwrap()
        .starts_with("[Agent Summary of Actions]"));
}

#[tokio::test]
async fn test_unknown_step_and_repeat_execution() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let agent = Agent::with_components(
        store.clone(),
        Arc::new(never_done_llm()),
        None,
        Some(Arc::new(MockAnalysisClient::new())),
        &AppConfig::default(),
    );
    let task_id = agent.start_task("Investigate address X", Map::new()).unwrap();
    let plan = aml_agent::workflow::planner::parse_plan(THREE_STEP_PLAN).unwrap();
    let mut delta = Map::new();
    delta.insert("plan".into(), serde_json::to_value(&plan).unwrap());
    store.update_state(&task_id, delta).unwrap();

    let dispatcher = Arc::new(ToolDispatcher::new(
        Arc::new(MockLlmClient::new()),
        None,
        Some(Arc::new(MockAnalysisClient::new())),
        &AppConfig::default(),
    ));
    let executor = StepExecutor::new(store.clone(), dispatcher);

    let before = store.get_state(&task_id).unwrap();
    let err = executor.execute_step(&task_id, Some(99)).await.unwrap_err();
    assert!(matches!(err, AgentError::StepNotFound { step_id: 99, .. }));
    assert_eq!(store.get_state(&task_id).unwrap(), before);

    let done = executor.execute_step(&task_id, Some(3)).await.unwrap();
    let again = executor.execute_step(&task_id, Some(3)).await.unwrap();
    assert!(matches!(again, StepOutcome::AlreadyExecuted(_)));
    assert_eq!(again.record(), done.record());

    let state = store.load(&task_id).unwrap();
    assert_eq!(state.execution.steps.len(), 1);
    assert_eq!(state.tool_calls.len(), 1);
    assert_eq!(state.execution.status, ExecutionStatus::Pending);

    // 之后按升序补齐 1、2，最后一步写入时 execution 即完成
    executor.execute_step(&task_id, None).await.unwrap();
    assert_eq!(store.load(&task_id).unwrap().execution.status, ExecutionStatus::Pending);
    let last = executor.execute_step(&task_id, None).await.unwrap();
    assert_eq!(last.record().unwrap().step_id, 2);
    let state = store.load(&task_id).unwrap();
    assert_eq!(state.execution.status, ExecutionStatus::Completed);
    let mut ids: Vec<_> = state.execution.steps.iter().map(|s| s.step_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unknown_task() {
    let agent = in_memory_agent(Arc::new(MockLlmClient::new()));
    assert!(agent.get_state("no-such-task").unwrap().is_empty());
    let err = agent.run("no-such-task").await.unwrap_err();
    assert!(matches!(err, AgentError::TaskNotFound(_)));
    assert!(agent.list_tasks(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_abort_feedback_applies_on_next_run() {
    let llm = Arc::new(MockLlmClient::with_handler(|req| {
        if is_planning(req) {
            Ok(THREE_STEP_PLAN.to_string())
        } else {
            Ok("```is_done\ntrue\n```\n```explanation\nok\n```".to_string())
        }
    }));
    let agent = in_memory_agent(llm);
    let task_id = agent.start_task("Check 0xabc", Map::new()).unwrap();
    agent.submit_feedback(&task_id, FeedbackEvent::new("abort")).unwrap();
    assert_eq!(agent.store().load(&task_id).unwrap().task.status, TaskStatus::Started);

    let state = agent.run(&task_id).await.unwrap();
    assert_eq!(state.task.status, TaskStatus::Aborted);
    assert_eq!(state.task.feedback_applied, 1);
    assert!(state.evaluation.is_done);
}

#[test]
fn test_sequential_updates_follow_merge_law() {
    let store = StateStore::open_in_memory().unwrap();
    let a = store.create_task(Map::new()).unwrap();
    let b = store.create_task(Map::new()).unwrap();

    let d1 = json!({ "context": { "hint": "x" }, "plan": [1], "evaluation": { "is_done": false } });
    let d2 = json!({ "context": { "tools": [] }, "plan": [2, 3] });
    let (Value::Object(d1), Value::Object(d2)) = (d1, d2) else {
        unreachable!()
    };

    store.update_state(&a, d1.clone()).unwrap();
    store.update_state(&a, d2.clone()).unwrap();

    let mut merged = d1;
    shallow_merge(&mut merged, d2);
    store.update_state(&b, merged).unwrap();

    let sa = store.get_state(&a).unwrap();
    let sb = store.get_state(&b).unwrap();
    assert_eq!(sa["context"], sb["context"]);
    assert_eq!(sa["evaluation"], sb["evaluation"]);
    assert_eq!(sa["plan"], json!([2, 3]));
    assert_eq!(sb["plan"], json!([2, 3]));
}

#[tokio::test]
async fn test_file_backed_agent_lists_tasks_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = AppConfig::default();
    cfg.app.storage_dir = Some(dir.path().join("data"));
    cfg.llm.api_key_env = "AML_AGENT_TEST_UNSET_KEY".to_string();

    let task_id = {
        let agent = Agent::from_config(&cfg).unwrap();
        let (task_id, _state) = agent.investigate("Trace 0xdef", Map::new()).await.unwrap();
        task_id
    };

    let agent = Agent::from_config(&cfg).unwrap();
    let tasks = agent.list_tasks(Some(5)).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_id, task_id);
    assert_eq!(tasks[0].description, "Trace 0xdef");
    assert!(agent.delete_task(&task_id).unwrap());
    assert!(agent.list_tasks(None).unwrap().is_empty());
}
