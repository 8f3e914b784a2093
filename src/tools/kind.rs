//! 步骤工具名到能力的静态映射

use std::fmt;

/// 结构化分析服务提供的工具
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisTool {
    TransactionAnalyzer,
    FetchTransaction,
    RiskChecker,
    ReportGenerator,
}

impl AnalysisTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisTool::TransactionAnalyzer => "transaction_analyzer",
            AnalysisTool::FetchTransaction => "fetch_transaction",
            AnalysisTool::RiskChecker => "risk_checker",
            AnalysisTool::ReportGenerator => "report_generator",
        }
    }
}

impl fmt::Display for AnalysisTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤由哪种能力执行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Retrieval,
    Analysis(AnalysisTool),
    Reasoning,
}

impl ToolKind {
    /// 已知名称返回 Some；未知名称返回 None，由调用方决定回退
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "rag" | "rag_tool" => ToolKind::Retrieval,
            "transaction_analyzer" => ToolKind::Analysis(AnalysisTool::TransactionAnalyzer),
            "fetch_transaction" => ToolKind::Analysis(AnalysisTool::FetchTransaction),
            "risk_checker" => ToolKind::Analysis(AnalysisTool::RiskChecker),
            "report_generator" => ToolKind::Analysis(AnalysisTool::ReportGenerator),
            "ai_model" | "sonnet" | "anthropic" | "claude" | "llm" => ToolKind::Reasoning,
            _ => return None,
        };
        Some(kind)
    }

    /// 未识别的工具名交给推理能力，并记录一次警告
    pub fn resolve(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            tracing::warn!(tool = %name, "unrecognized tool name, routing step to reasoning");
            ToolKind::Reasoning
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names() {
        assert_eq!(ToolKind::from_name("rag_tool"), Some(ToolKind::Retrieval));
        assert_eq!(
            ToolKind::from_name("risk_checker"),
            Some(ToolKind::Analysis(AnalysisTool::RiskChecker))
        );
        assert_eq!(ToolKind::from_name("claude"), Some(ToolKind::Reasoning));
    }

    #[test]
    fn test_unknown_name_falls_back_to_reasoning() {
        assert_eq!(ToolKind::from_name("graph_cluster"), None);
        assert_eq!(ToolKind::resolve("graph_cluster"), ToolKind::Reasoning);
    }

    #[test]
    fn test_analysis_names_round_trip() {
        for tool in [
            AnalysisTool::TransactionAnalyzer,
            AnalysisTool::FetchTransaction,
            AnalysisTool::RiskChecker,
            AnalysisTool::ReportGenerator,
        ] {
            assert_eq!(ToolKind::from_name(tool.as_str()), Some(ToolKind::Analysis(tool)));
        }
    }
}
