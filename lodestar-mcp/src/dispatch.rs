//! Dispatch shell: argument validation, id lookup and envelope shaping for
//! the research operations.
//!
//! Every tool operation reduces to the same skeleton: validate the inputs,
//! resolve the research id if one is involved, call into the
//! [`ResearchService`], and fold the outcome into an [`Envelope`]. Nothing
//! here returns a protocol error; every call ends in exactly one envelope.

use lodestar_core::prompt;
use lodestar_core::types::summarize_sources;
use lodestar_core::{ProgressSender, ResearchMode, ResearchService, ResearchUnit};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{DispatchError, Envelope, Operation};

type Args = Map<String, Value>;

/// Routes operations to the research service.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    service: ResearchService,
}

impl Dispatcher {
    pub fn new(service: ResearchService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ResearchService {
        &self.service
    }

    /// Run a tool operation. `progress` is only consulted by `deep_research`.
    pub async fn call_tool(
        &self,
        operation: Operation,
        arguments: &Value,
        progress: Option<ProgressSender>,
    ) -> Envelope {
        debug!(operation = %operation, "Dispatching tool call");
        let result = match as_args(arguments) {
            Ok(args) => match operation {
                Operation::DeepResearch => self.deep_research(args, progress).await,
                Operation::QuickSearch => self.quick_search(args).await,
                Operation::WriteReport => self.write_report(args).await,
                Operation::GetResearchSources => self.get_research_sources(args),
                Operation::GetResearchContext => self.get_research_context(args),
                Operation::ResearchResource | Operation::ResearchQuery => Err(
                    DispatchError::invalid_input("name", format!("'{operation}' is not a tool")),
                ),
            },
            Err(e) => Err(e),
        };

        if let Err(err) = &result {
            warn!(operation = %operation, kind = ?err.kind(), error = %err, "Operation failed");
        }
        Envelope::from_result(operation, result)
    }

    async fn deep_research(
        &self,
        args: &Args,
        progress: Option<ProgressSender>,
    ) -> Result<Value, DispatchError> {
        let query = required_str(args, "query")?;
        let deep = optional_bool(args, "deep")?;
        let unit = self
            .service
            .deep_research(query, ResearchMode::from_deep(deep), progress)
            .await?;

        Ok(json!({
            "research_id": unit.id.to_string(),
            "query": unit.query,
            "source_count": unit.sources.len(),
            "context": unit.context,
            "sources": summarize_sources(&unit.sources),
            "source_urls": unit.source_urls,
        }))
    }

    async fn quick_search(&self, args: &Args) -> Result<Value, DispatchError> {
        let query = required_str(args, "query")?;
        let unit = self.service.quick_search(query).await?;

        Ok(json!({
            "search_id": unit.id.to_string(),
            "query": unit.query,
            "result_count": unit.search_results.len(),
            "search_results": unit.search_results,
        }))
    }

    async fn write_report(&self, args: &Args) -> Result<Value, DispatchError> {
        let id = self.lookup(args)?.id;
        let custom_prompt = optional_str(args, "custom_prompt")?;
        let unit = self.service.write_report(&id, custom_prompt).await?;

        Ok(json!({
            "report": unit.report.unwrap_or_default(),
            "source_count": unit.sources.len(),
            "costs": unit.costs,
        }))
    }

    fn get_research_sources(&self, args: &Args) -> Result<Value, DispatchError> {
        let unit = self.lookup(args)?;
        Ok(json!({
            "sources": summarize_sources(&unit.sources),
            "source_urls": unit.source_urls,
        }))
    }

    fn get_research_context(&self, args: &Args) -> Result<Value, DispatchError> {
        let unit = self.lookup(args)?;
        Ok(json!({ "context": unit.context }))
    }

    /// Resolve `research_id`. Malformed and unknown ids are both "not found".
    fn lookup(&self, args: &Args) -> Result<ResearchUnit, DispatchError> {
        let raw = required_str(args, "research_id")?;
        let id = Uuid::parse_str(raw.trim()).map_err(|_| DispatchError::SessionNotFound {
            id: raw.to_string(),
        })?;
        Ok(self.service.unit(&id)?)
    }

    /// Read `research://{topic}`: cached formatted context, researching on a
    /// miss. Failures come back as plain text and are not cached.
    pub async fn research_resource(&self, topic: &str) -> String {
        match self.service.research_topic(topic).await {
            Ok(entry) => entry.formatted_context.clone(),
            Err(e) => {
                warn!(topic, error = %e, "Topic research failed");
                format!("Error conducting research on '{topic}': {e}")
            }
        }
    }

    /// Render the `research_query` prompt.
    pub fn research_query(&self, arguments: &Value) -> Result<String, DispatchError> {
        let args = as_args(arguments)?;
        let topic = required_str(args, "topic")?;
        let goal = required_str(args, "goal")?;
        let report_format = optional_str(args, "report_format")?;
        Ok(prompt::research_query(topic, goal, report_format))
    }
}

static EMPTY_ARGS: std::sync::LazyLock<Args> = std::sync::LazyLock::new(Map::new);

fn as_args(arguments: &Value) -> Result<&Args, DispatchError> {
    match arguments {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(&EMPTY_ARGS),
        _ => Err(DispatchError::invalid_input(
            "arguments",
            "expected an object",
        )),
    }
}

/// A present, string-typed, non-blank argument.
fn required_str<'a>(args: &'a Args, field: &str) -> Result<&'a str, DispatchError> {
    match args.get(field) {
        None | Some(Value::Null) => Err(DispatchError::invalid_input(field, "is required")),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(DispatchError::invalid_input(field, "must not be blank"))
        }
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(DispatchError::invalid_input(field, "must be a string")),
    }
}

/// An optional string argument. Absent, null and blank all read as `None`.
fn optional_str<'a>(args: &'a Args, field: &str) -> Result<Option<&'a str>, DispatchError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(DispatchError::invalid_input(field, "must be a string")),
    }
}

/// An optional boolean argument defaulting to `false`.
fn optional_bool(args: &Args, field: &str) -> Result<bool, DispatchError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(DispatchError::invalid_input(field, "must be a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ErrorKind;
    use lodestar_core::types::Source;
    use lodestar_core::StaticEngine;
    use std::sync::Arc;

    fn dispatcher() -> (Dispatcher, Arc<StaticEngine>) {
        let engine = Arc::new(StaticEngine::new(
            "CPI rose 3.1% over the year.",
            vec![Source::new("BLS Report", "https://bls.gov/x", "CPI tables")],
        ));
        (
            Dispatcher::new(ResearchService::new(engine.clone())),
            engine,
        )
    }

    fn error_kind(env: &Envelope) -> ErrorKind {
        env.error.as_ref().unwrap().kind
    }

    #[tokio::test]
    async fn test_deep_research_data_fields() {
        let (dispatcher, _) = dispatcher();
        let env = dispatcher
            .call_tool(
                Operation::DeepResearch,
                &json!({"query": "current US inflation rate", "deep": false}),
                None,
            )
            .await;
        assert!(env.success);
        let data = env.data.unwrap();
        assert_eq!(data["source_count"], 1);
        assert_eq!(data["source_urls"], json!(["https://bls.gov/x"]));
        assert_eq!(data["sources"][0]["title"], "BLS Report");
        assert_eq!(data["sources"][0]["content_length"], 10);
        assert!(Uuid::parse_str(data["research_id"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_deep_defaults_to_false() {
        let (dispatcher, _) = dispatcher();
        let env = dispatcher
            .call_tool(Operation::DeepResearch, &json!({"query": "q"}), None)
            .await;
        assert!(env.success);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (dispatcher, engine) = dispatcher();
        for args in [
            json!({}),
            json!({"query": ""}),
            json!({"query": "   "}),
            json!({"query": 42}),
            json!({"query": "q", "deep": "yes"}),
            json!(["q"]),
        ] {
            let env = dispatcher
                .call_tool(Operation::DeepResearch, &args, None)
                .await;
            assert!(!env.success, "{args}");
            assert_eq!(error_kind(&env), ErrorKind::InvalidInput);
        }
        assert_eq!(engine.research_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let (dispatcher, _) = dispatcher();
        let unknown = Uuid::new_v4().to_string();
        for op in [
            Operation::WriteReport,
            Operation::GetResearchSources,
            Operation::GetResearchContext,
        ] {
            for id in [unknown.as_str(), "not-a-uuid"] {
                let env = dispatcher
                    .call_tool(op, &json!({"research_id": id}), None)
                    .await;
                let error = env.error.unwrap();
                assert_eq!(error.kind, ErrorKind::SessionNotFound);
                assert_eq!(error.operation, op);
                assert!(error.message.contains(id));
            }
        }
    }

    #[tokio::test]
    async fn test_follow_up_operations() {
        let (dispatcher, _) = dispatcher();
        let env = dispatcher
            .call_tool(Operation::DeepResearch, &json!({"query": "inflation"}), None)
            .await;
        let id = env.data.unwrap()["research_id"].clone();

        let env = dispatcher
            .call_tool(Operation::GetResearchContext, &json!({"research_id": id}), None)
            .await;
        assert_eq!(env.data.unwrap()["context"], "CPI rose 3.1% over the year.");

        let env = dispatcher
            .call_tool(Operation::GetResearchSources, &json!({"research_id": id}), None)
            .await;
        assert_eq!(env.data.unwrap()["source_urls"], json!(["https://bls.gov/x"]));

        let env = dispatcher
            .call_tool(
                Operation::WriteReport,
                &json!({"research_id": id, "custom_prompt": null}),
                None,
            )
            .await;
        let data = env.data.unwrap();
        assert!(data["report"].as_str().unwrap().starts_with("# inflation"));
        assert_eq!(data["source_count"], 1);
    }

    #[tokio::test]
    async fn test_engine_failure_envelope() {
        let engine = Arc::new(StaticEngine::offline().failing("search provider unavailable"));
        let dispatcher = Dispatcher::new(ResearchService::new(engine));
        let env = dispatcher
            .call_tool(Operation::QuickSearch, &json!({"query": "q"}), None)
            .await;
        let error = env.error.unwrap();
        assert_eq!(error.kind, ErrorKind::EngineError);
        assert_eq!(error.operation, Operation::QuickSearch);
        assert_eq!(error.message, "search provider unavailable");
    }

    #[tokio::test]
    async fn test_report_engine_failure_envelope() {
        let engine = Arc::new(
            StaticEngine::new("CPI rose 3.1%.", vec![])
                .with_costs(0.01)
                .failing_reports("report writer rate limited (429)"),
        );
        let dispatcher = Dispatcher::new(ResearchService::new(engine));
        let env = dispatcher
            .call_tool(Operation::DeepResearch, &json!({"query": "inflation"}), None)
            .await;
        let id = env.data.unwrap()["research_id"].as_str().unwrap().to_string();

        let env = dispatcher
            .call_tool(Operation::WriteReport, &json!({"research_id": id}), None)
            .await;
        assert!(!env.success);
        let error = env.error.unwrap();
        assert_eq!(error.kind, ErrorKind::EngineError);
        assert_eq!(error.operation, Operation::WriteReport);
        assert_eq!(error.message, "report writer rate limited (429)");

        let unit = dispatcher
            .service()
            .unit(&Uuid::parse_str(&id).unwrap())
            .unwrap();
        assert!(unit.report.is_none());
        assert!((unit.costs - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_research_resource_failure_text() {
        let engine = Arc::new(StaticEngine::offline().failing("timeout"));
        let dispatcher = Dispatcher::new(ResearchService::new(engine));
        let text = dispatcher.research_resource("volcanoes").await;
        assert_eq!(text, "Error conducting research on 'volcanoes': timeout");
        assert!(dispatcher.service().cache().is_empty());
    }

    #[test]
    fn test_research_query_prompt() {
        let (dispatcher, _) = dispatcher();
        let prompt = dispatcher
            .research_query(&json!({"topic": "tides", "goal": "explain neap tides"}))
            .unwrap();
        assert!(prompt.contains("tides"));
        assert!(prompt.contains("research_report"));

        let err = dispatcher.research_query(&json!({"topic": "tides"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
