//! Runs an agent as a tool of another agent.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use crate::core::agent::{Agent, RunContext};
use crate::core::events::ToolOutput;
use crate::core::stream::{AgentStreams, StreamProxy};
use crate::tools::ToolContext;

/// Runs `agent` on `input["input"]` with the tool's node as the agent node.
///
/// The child gets fresh streams proxied into its node for the duration of
/// the run. Boxed because agent runs nest recursively.
pub fn execute<'a>(
    agent: &'a Arc<Agent>,
    input: &'a Value,
    ctx: &'a ToolContext,
) -> BoxFuture<'a, ToolOutput> {
    async move {
        let Some(task) = input.get("input").and_then(Value::as_str) else {
            return ToolOutput::failure(
                "invalid_input",
                "Missing required string field 'input'",
                None,
            );
        };

        let streams = AgentStreams::new();
        let proxy = StreamProxy::attach(&streams, ctx.node.clone());
        let run_ctx = RunContext::new(ctx.job.clone(), ctx.node.clone(), streams);

        let result = agent.run(task, &run_ctx).await;
        proxy.finish().await;

        match result {
            Ok(text) => ToolOutput::success(json!({ "result": text })),
            Err(e) => {
                tracing::warn!(agent = %agent.name(), job_id = %ctx.job.job_id(), "nested agent failed: {e:#}");
                ToolOutput::failure("agent_error", format!("{e:#}"), None)
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::call_tree::{CallKind, CallState, CallTree, Step};
    use crate::core::job::{ChatBinding, JobContext, JobInfo};
    use crate::providers::{ScriptedClient, ScriptedTurn};
    use crate::tools::Tool;

    fn research_agent(turns: Vec<ScriptedTurn>) -> Arc<Agent> {
        let lookup = Tool::function(
            "lookup",
            "Looks things up",
            json!({"type": "object"}),
            |_input: Value, ctx: ToolContext| async move {
                ctx.log("searching index");
                Ok(ToolOutput::success(json!({"hits": 2})))
            },
        );
        Arc::new(
            Agent::builder("research_agent", Arc::new(ScriptedClient::new(turns)))
                .tool(lookup)
                .build()
                .unwrap(),
        )
    }

    struct Setup {
        tree: CallTree,
        streams: AgentStreams,
        master: Agent,
    }

    fn setup(child_turns: Vec<ScriptedTurn>) -> Setup {
        let child = research_agent(child_turns);
        let master = Agent::builder(
            "master_agent",
            Arc::new(ScriptedClient::new([
                ScriptedTurn::tool_call("research_agent", &json!({"input": "find hits"})),
                ScriptedTurn::text("Found them."),
            ])),
        )
        .tool(Tool::agent(child, "Researches"))
        .build()
        .unwrap();
        Setup {
            tree: CallTree::default(),
            streams: AgentStreams::new(),
            master,
        }
    }

    async fn run(setup: &Setup) -> anyhow::Result<String> {
        let root = setup.tree.add_root(CallKind::Agent, "master_agent", Some(json!("go")));
        let proxy = StreamProxy::attach(&setup.streams, root.clone());
        let job = JobContext::new(JobInfo::new(ChatBinding::default(), "go"));
        let ctx = RunContext::new(job, root, setup.streams.clone());
        let result = setup.master.run("go", &ctx).await;
        proxy.finish().await;
        result
    }

    #[tokio::test]
    async fn child_progress_lands_in_the_child_node() {
        let setup = setup(vec![
            ScriptedTurn::tool_call("lookup", &json!({})).with_reasoning("need data"),
            ScriptedTurn::text("2 hits"),
        ]);

        assert_eq!(run(&setup).await.unwrap(), "Found them.");

        let snapshot = setup.tree.snapshot();
        let root = snapshot.node(snapshot.roots()[0]).unwrap();
        let child = snapshot.node(root.children[0]).unwrap();
        assert_eq!(child.kind, CallKind::Agent);
        assert_eq!(child.state, CallState::Completed);
        assert_eq!(child.task(), Some("find hits"));
        assert_eq!(child.reasoning, "need data");
        assert_eq!(child.text, "2 hits");
        assert_eq!(child.output, Some(json!({"result": "2 hits"})));

        let lookup = snapshot.node(child.children[0]).unwrap();
        assert_eq!(child.steps, vec![Step::Call(lookup.id)]);
        assert_eq!(lookup.steps, vec![Step::Log("searching index".to_string())]);
        assert_eq!(setup.streams.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn child_failure_becomes_agent_error() {
        let setup = setup(vec![ScriptedTurn::fail("child overloaded")]);

        assert_eq!(run(&setup).await.unwrap(), "Found them.");

        let snapshot = setup.tree.snapshot();
        let root = snapshot.node(snapshot.roots()[0]).unwrap();
        let child = snapshot.node(root.children[0]).unwrap();
        assert_eq!(child.state, CallState::Error);
        assert_eq!(child.output.as_ref().unwrap()["code"], "agent_error");
        assert!(child.text.is_empty());
        assert_eq!(setup.streams.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn missing_input_is_rejected() {
        let tree = CallTree::default();
        let node = tree.add_root(CallKind::Agent, "research_agent", None);
        let ctx = ToolContext::new(JobContext::new(JobInfo::new(ChatBinding::default(), "x")), node, None);
        let agent = research_agent(vec![]);

        let output = execute(&agent, &json!({"task": "x"}), &ctx).await;
        assert_eq!(output.error_info().and_then(|(code, _)| code), Some("invalid_input"));
    }
}
