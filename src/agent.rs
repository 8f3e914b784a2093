//! Headless Agent 运行时
//!
//! Agent::from_config 按配置装配状态库、推理 / 检索 / 分析能力、工具分派器与工作流组件；
//! investigate 对一条任务描述跑完整的规划 → 执行 → 评估，chat 在会话中完成同样的事并记录对话。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{ConversationManager, Message, StateStore};
use crate::tools::{
    AnalysisClient, CachedCatalog, HttpAnalysisClient, HttpRetrievalClient, MockAnalysisClient,
    RetrievalClient, ToolDispatcher,
};
use crate::workflow::{
    FeedbackEvent, Orchestrator, PlanGenerator, ResultEvaluator, StepExecutor, TaskId, TaskState,
    TaskSummary, WorkflowEngine,
};

/// chat 放入任务 context 的最近对话轮数
const CHAT_CONTEXT_TURNS: usize = 10;

const NO_ANSWER: &str = "I couldn't process that request.";

/// 按配置选择分析能力：use_mock 用内置样例，否则有 base_url 时用 HTTP；工具目录统一经过缓存
pub fn create_analysis_from_config(cfg: &AppConfig) -> Option<Arc<dyn AnalysisClient>> {
    let section = &cfg.analysis;
    let inner: Arc<dyn AnalysisClient> = if section.use_mock {
        tracing::info!("Using mock analysis tools");
        Arc::new(MockAnalysisClient::new())
    } else {
        let url = section.base_url.as_ref()?;
        Arc::new(HttpAnalysisClient::new(
            url.clone(),
            section.api_key.clone(),
            section.timeout_secs,
        ))
    };
    Some(Arc::new(CachedCatalog::new(
        inner,
        Duration::from_secs(section.catalog_ttl_secs),
    )))
}

pub fn create_retrieval_from_config(cfg: &AppConfig) -> Option<Arc<dyn RetrievalClient>> {
    match HttpRetrievalClient::from_config(&cfg.retrieval) {
        Some(client) => Some(Arc::new(client)),
        None => {
            tracing::info!("Retrieval not configured, planning without reference material");
            None
        }
    }
}

/// 装配完成的 Agent，可在多个会话间共享
pub struct Agent {
    store: Arc<StateStore>,
    orchestrator: Arc<Orchestrator>,
    engine: WorkflowEngine,
    conversations: ConversationManager,
    list_limit: usize,
}

impl Agent {
    /// 打开配置中的数据库文件并按配置创建各能力
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let store = Arc::new(StateStore::open(cfg.app.database_path())?);
        Ok(Self::with_components(
            store,
            create_llm_from_config(cfg),
            create_retrieval_from_config(cfg),
            create_analysis_from_config(cfg),
            cfg,
        ))
    }

    /// 用给定的状态库与能力装配（测试注入 Mock 时使用）
    pub fn with_components(
        store: Arc<StateStore>,
        llm: Arc<dyn LlmClient>,
        retrieval: Option<Arc<dyn RetrievalClient>>,
        analysis: Option<Arc<dyn AnalysisClient>>,
        cfg: &AppConfig,
    ) -> Self {
        let dispatcher = Arc::new(ToolDispatcher::new(
            llm.clone(),
            retrieval.clone(),
            analysis.clone(),
            cfg,
        ));
        let orchestrator = Arc::new(Orchestrator::new(store.clone()));
        let planner = Arc::new(PlanGenerator::new(
            store.clone(),
            llm.clone(),
            retrieval,
            analysis,
            cfg,
        ));
        let executor = Arc::new(StepExecutor::new(store.clone(), dispatcher));
        let evaluator = Arc::new(ResultEvaluator::new(store.clone(), llm, cfg));
        let engine = WorkflowEngine::new(
            store.clone(),
            orchestrator.clone(),
            planner,
            executor,
            evaluator,
        );

        Self {
            conversations: ConversationManager::new(store.clone()),
            store,
            orchestrator,
            engine,
            list_limit: cfg.app.list_limit,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn start_task(
        &self,
        description: &str,
        context: Map<String, Value>,
    ) -> Result<TaskId, AgentError> {
        self.orchestrator.start_task(description, context)
    }

    pub async fn run(&self, task_id: &str) -> Result<TaskState, AgentError> {
        self.engine.run(task_id).await
    }

    /// 新建任务并跑到终态
    pub async fn investigate(
        &self,
        description: &str,
        context: Map<String, Value>,
    ) -> Result<(TaskId, TaskState), AgentError> {
        let task_id = self.start_task(description, context)?;
        let state = self.run(&task_id).await?;
        Ok((task_id, state))
    }

    pub fn submit_feedback(&self, task_id: &str, event: FeedbackEvent) -> Result<(), AgentError> {
        self.orchestrator.submit_feedback(task_id, event)
    }

    /// limit 为 None 时使用配置的 list_limit
    pub fn list_tasks(&self, limit: Option<usize>) -> Result<Vec<TaskSummary>, AgentError> {
        self.store.list_tasks(limit.unwrap_or(self.list_limit))
    }

    pub fn get_state(&self, task_id: &str) -> Result<Map<String, Value>, AgentError> {
        self.store.get_state(task_id)
    }

    pub fn delete_task(&self, task_id: &str) -> Result<bool, AgentError> {
        self.store.delete_task(task_id)
    }

    pub fn start_session(&self) -> Result<String, AgentError> {
        self.conversations.start_session()
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        self.conversations.history(session_id)
    }

    /// 会话内的一轮：记录输入 → 以最近对话为 context 跑任务 → 记录并返回回复
    pub async fn chat(&self, session_id: &str, input: &str) -> Result<Message, AgentError> {
        self.conversations.process_input(session_id, input)?;

        let history = self.conversations.history(session_id)?;
        let recent = &history[history.len().saturating_sub(CHAT_CONTEXT_TURNS)..];
        let mut context = Map::new();
        context.insert("messages".into(), serde_json::to_value(recent)?);
        context.insert("session_id".into(), json!(session_id));

        let (task_id, state) = self.investigate(input, context).await?;
        let response = Message::assistant(response_text(&state)).with_task(task_id);
        self.conversations.add_response(session_id, response.clone())?;
        Ok(response)
    }
}

/// 评估的 summary 优先，其次 explanation，都没有时给固定提示
pub fn response_text(state: &TaskState) -> String {
    let evaluation = &state.evaluation;
    evaluation
        .extra_str("summary")
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            Some(evaluation.explanation.clone()).filter(|s| !s.trim().is_empty())
        })
        .unwrap_or_else(|| NO_ANSWER.to_string())
}
