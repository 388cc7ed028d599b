//! Tool-routing pre-step: a cheap non-streaming call decides whether the
//! turn needs a web search before the real generation starts.

use serde::Deserialize;

use crate::dispatch::http::{HttpDispatch, Target};
use crate::dispatch::search::SearchClient;
use crate::dispatch::{ChatMessage, MessageContent};
use crate::error::RelayError;
use crate::store::Role;
use crate::tags;

pub const SEARCH_TOOL: &str = "online_search";

const ROUTING_PROMPT: &str = "\
- Call the web search tool for questions that need external information to answer, or that would be answered better with it.
- Call the web search tool for time-sensitive questions (weather, news, live data) or questions mentioning recent dates such as today, this week or this month.
- If the question does not need a search, reply only with \"no search needed\".";

const SEARCH_GUIDANCE: &str = "\
- You have just called the web search tool.
- Prefer the search results when answering.
- Answer in clear, structured language (numbered points, short sections).
- Do not mention sources or references in the answer.";

/// The `tools` array offered to the routing model.
pub fn search_tools() -> serde_json::Value {
    serde_json::json!([{
        "type": "function",
        "function": {
            "name": SEARCH_TOOL,
            "description": "Search the internet for information",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search keywords"},
                    "num": {"type": "integer", "description": "Number of results"}
                },
                "required": ["query"]
            }
        }
    }])
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    num: Option<usize>,
}

/// Outcome of a routing call that elected to search.
#[derive(Debug, Clone)]
pub struct SearchRoute {
    /// `<search>[{"href","title"}…]</search>`, pushed first and kept as prefix.
    pub block: String,
    /// Assistant tool call, tool result and guidance, appended to the request.
    pub messages: Vec<ChatMessage>,
}

/// Ask `router` whether `history` needs a search and run it if so.
/// `Ok(None)` means generate without search.
pub async fn route(
    http: &HttpDispatch,
    router: &Target<'_>,
    search: &SearchClient,
    history: &[ChatMessage],
) -> Result<Option<SearchRoute>, RelayError> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::text(Role::System, ROUTING_PROMPT));
    messages.extend(history.iter().cloned());

    let completion = http
        .complete(router, &messages, Some(&search_tools()), None)
        .await?;

    let Some(call) = completion.tool_calls.into_iter().next() else {
        tracing::debug!(router = router.display, "routing elected no tool");
        return Ok(None);
    };
    if call.function.name != SEARCH_TOOL {
        tracing::debug!(tool = %call.function.name, "routing elected an unknown tool, ignoring");
        return Ok(None);
    }

    let args: SearchArgs = serde_json::from_str(&call.function.arguments)
        .map_err(|e| RelayError::SchemaParse(format!("online_search arguments: {e}")))?;
    if args.query.trim().is_empty() {
        return Ok(None);
    }

    let results = search.search(&args.query, args.num).await?;
    if results.is_empty() {
        tracing::info!(query = %args.query, "web search returned nothing");
        return Ok(None);
    }

    let links: Vec<serde_json::Value> = results
        .iter()
        .map(|r| serde_json::json!({"href": r.href, "title": r.title}))
        .collect();
    let links = serde_json::to_string(&links)
        .map_err(|e| RelayError::Other(format!("encode search links: {e}")))?;
    let tool_output = serde_json::to_string(&results)
        .map_err(|e| RelayError::Other(format!("encode search results: {e}")))?;

    let tool_call_id = call.id.clone();
    let messages = vec![
        ChatMessage {
            role: Role::Assistant,
            content: MessageContent::Text(String::new()),
            tool_calls: Some(vec![call]),
            tool_call_id: None,
        },
        ChatMessage {
            role: Role::Tool,
            content: MessageContent::Text(tool_output),
            tool_calls: None,
            tool_call_id: Some(tool_call_id),
        },
        ChatMessage::text(Role::System, SEARCH_GUIDANCE),
    ];

    tracing::info!(query = %args.query, hits = results.len(), "web search attached");
    Ok(Some(SearchRoute {
        block: tags::search_block(&links),
        messages,
    }))
}
