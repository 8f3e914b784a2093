//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AML__*` 覆盖（双下划线表示嵌套，如 `AML__LLM__MODEL=gpt-4o`）。
//! 配置在启动时构造一次，按引用传入各组件构造函数；组件逻辑内部不再读取环境变量。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
}

/// [app] 段：存储目录、数据库文件名、任务列表默认条数
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 状态库所在目录，未设置时用 ~/.aml_agent/data
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            storage_dir: None,
            database_file: default_database_file(),
            list_limit: default_list_limit(),
        }
    }
}

fn default_database_file() -> String {
    "sessions.db".to_string()
}

fn default_list_limit() -> usize {
    10
}

impl AppSection {
    /// 解析后的数据库路径：storage_dir > $HOME/.aml_agent/data > ./.aml_agent_data
    pub fn database_path(&self) -> PathBuf {
        let dir = self.storage_dir.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".aml_agent").join("data"))
                .unwrap_or_else(|| PathBuf::from(".aml_agent_data"))
        });
        dir.join(&self.database_file)
    }
}

/// [llm] 段：OpenAI 兼容端点、模型、超时，以及三个调用方各自的采样参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default = "default_planner_sampling")]
    pub planner: SamplingSection,
    #[serde(default = "default_executor_sampling")]
    pub executor: SamplingSection,
    #[serde(default = "default_evaluator_sampling")]
    pub evaluator: SamplingSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            timeouts: LlmTimeoutsSection::default(),
            planner: default_planner_sampling(),
            executor: default_executor_sampling(),
            evaluator: default_evaluator_sampling(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

impl LlmSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request)
    }
}

/// 单个调用方的 max_tokens / temperature
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SamplingSection {
    pub max_tokens: u32,
    pub temperature: f32,
}

fn default_planner_sampling() -> SamplingSection {
    SamplingSection {
        max_tokens: 1000,
        temperature: 0.2,
    }
}

fn default_executor_sampling() -> SamplingSection {
    SamplingSection {
        max_tokens: 1500,
        temperature: 0.2,
    }
}

fn default_evaluator_sampling() -> SamplingSection {
    SamplingSection {
        max_tokens: 2000,
        temperature: 0.2,
    }
}

/// [retrieval] 段：检索服务；未配置 base_url 时规划阶段跳过参考资料收集
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_capability_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            top_k: default_top_k(),
            timeout_secs: default_capability_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

fn default_capability_timeout_secs() -> u64 {
    30
}

/// [analysis] 段：结构化分析工具服务；use_mock 时使用内置样例数据
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_use_mock")]
    pub use_mock: bool,
    #[serde(default = "default_capability_timeout_secs")]
    pub timeout_secs: u64,
    /// 工具目录缓存时长（秒）
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            use_mock: default_use_mock(),
            timeout_secs: default_capability_timeout_secs(),
            catalog_ttl_secs: default_catalog_ttl_secs(),
        }
    }
}

fn default_use_mock() -> bool {
    true
}

fn default_catalog_ttl_secs() -> u64 {
    60
}

/// 从 config 目录加载配置，环境变量 AML__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AML__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AML")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sampling_per_caller() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.planner.max_tokens, 1000);
        assert_eq!(cfg.llm.executor.max_tokens, 1500);
        assert_eq!(cfg.llm.evaluator.max_tokens, 2000);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.analysis.catalog_ttl_secs, 60);
        assert!(cfg.analysis.use_mock);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[app]\nstorage_dir = \"/tmp/aml\"\n\n[llm]\nmodel = \"local-model\"\n\n[llm.evaluator]\nmax_tokens = 512\ntemperature = 0.0\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.llm.model, "local-model");
        assert_eq!(cfg.llm.evaluator.max_tokens, 512);
        assert_eq!(cfg.llm.planner.max_tokens, 1000);
        assert_eq!(
            cfg.app.database_path(),
            PathBuf::from("/tmp/aml").join("sessions.db")
        );
    }
}
