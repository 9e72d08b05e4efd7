use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kalpana::{CandidateFact, Hop};
use kalpana_knowledge::KnowledgeBase;
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use tracing::info;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_BATCH_FACTS: usize = 1000;
const MAX_NAME_BYTES: usize = 512;
const MAX_HOPS: usize = 5;

struct AppState {
    kb: KnowledgeBase,
}

impl AppState {
    fn open() -> Result<Self> {
        let db_path = env::var("KALPANA_MCP_DB_PATH")
            .unwrap_or_else(|_| "./kalpana-mcp.kalpana".to_string());
        let kb = KnowledgeBase::open(&db_path)?;
        info!(%db_path, "knowledge base opened");
        Ok(Self { kb })
    }
}

fn main() -> Result<()> {
    // stdout carries the protocol; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let state = AppState::open().context("failed to open kalpana database")?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Malformed framing should not kill the server — return JSON-RPC
                // parse error (-32700) and continue reading the next message.
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "kalpana-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": {
                        "content": [{ "type": "text", "text": format!("tool error: {err}") }],
                        "isError": true
                    }
                }),
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "ingest_facts",
            "description": "Ingest a batch of extracted candidate facts into the knowledge graph.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "facts": {
                        "type": "array",
                        "maxItems": MAX_BATCH_FACTS,
                        "items": {
                            "type": "object",
                            "properties": {
                                "subject": {
                                    "type": "object",
                                    "properties": {
                                        "name": {"type": "string"},
                                        "type_tag": {"type": "string"},
                                        "alias_hints": {"type": "array", "items": {"type": "string"}}
                                    },
                                    "required": ["name", "type_tag"]
                                },
                                "predicate": {"type": "string"},
                                "object": {
                                    "type": "object",
                                    "properties": {
                                        "kind": {"type": "string", "enum": ["Entity", "Literal"]},
                                        "value": {}
                                    },
                                    "required": ["kind", "value"]
                                },
                                "provenance": {
                                    "type": "object",
                                    "properties": {
                                        "source": {"type": "string"},
                                        "extracted_at": {"type": "string"},
                                        "confidence": {"type": "number"}
                                    },
                                    "required": ["source", "extracted_at"]
                                },
                                "observed_at": {"type": "string"}
                            },
                            "required": ["subject", "predicate", "object", "provenance"]
                        }
                    }
                },
                "required": ["facts"]
            }
        }),
        json!({
            "name": "query_entity",
            "description": "Answer a question about an entity: current state, state at a past instant, or the full ingestion history. Every fact comes with citations.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": {"type": "string"},
                    "entity_type": {"type": "string", "default": "Mission"},
                    "predicate": {"type": "string"},
                    "as_of": {"type": "string", "description": "RFC3339 instant; omit for current state"},
                    "history": {"type": "boolean", "description": "Return every recorded fact, superseded intervals included"}
                },
                "required": ["subject"]
            }
        }),
        json!({
            "name": "related_entities",
            "description": "Traverse the graph from an entity over one or more predicate hops, all evaluated at one instant.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": {"type": "string"},
                    "entity_type": {"type": "string", "default": "Mission"},
                    "hops": {
                        "type": "array",
                        "maxItems": MAX_HOPS,
                        "items": {
                            "type": "object",
                            "properties": {
                                "out": {"type": "string"},
                                "in": {"type": "string"}
                            }
                        }
                    },
                    "as_of": {"type": "string"}
                },
                "required": ["subject", "hops"]
            }
        }),
        json!({
            "name": "list_predicates",
            "description": "List the declared predicate vocabulary.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

fn call_tool(state: &AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "ingest_facts" => {
            let facts_json = args.get("facts").context("facts is required")?;
            let count = facts_json.as_array().map(Vec::len).unwrap_or(0);
            if count > MAX_BATCH_FACTS {
                anyhow::bail!("batch exceeds max allowed size ({MAX_BATCH_FACTS} facts)");
            }
            let batch: Vec<CandidateFact> = serde_json::from_value(facts_json.clone())
                .context("facts must be an array of candidate facts")?;

            let report = state.kb.ingest(batch)?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "applied {} fact(s), skipped {}",
                        report.applied,
                        report.skipped.len()
                    )
                }],
                "structuredContent": report
            }))
        }
        "query_entity" => {
            let subject = required_name(&args, "subject")?;
            let entity_type = args
                .get("entity_type")
                .and_then(JsonValue::as_str)
                .unwrap_or("Mission");
            let predicate = args.get("predicate").and_then(JsonValue::as_str);
            let as_of = parse_as_of(args.get("as_of"))?;
            let history = args
                .get("history")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);

            let answer = if history {
                state.kb.history(subject, entity_type, predicate)?
            } else {
                state.kb.ask(subject, entity_type, predicate, as_of)?
            };

            match answer {
                None => Ok(json!({
                    "content": [{ "type": "text", "text": format!("no known entity {subject:?} of type {entity_type:?}") }],
                    "structuredContent": { "found": false }
                })),
                Some(answer) => Ok(json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{} fact(s) about {subject}", answer.facts.len())
                    }],
                    "structuredContent": {
                        "found": true,
                        "facts": answer.facts,
                        "citations": answer.citations
                    }
                })),
            }
        }
        "related_entities" => {
            let subject = required_name(&args, "subject")?;
            let entity_type = args
                .get("entity_type")
                .and_then(JsonValue::as_str)
                .unwrap_or("Mission");
            let hops_json = args.get("hops").context("hops is required")?;
            let hops: Vec<Hop> = serde_json::from_value(hops_json.clone())
                .context("hops must be an array of {\"out\": pred} or {\"in\": pred}")?;
            if hops.is_empty() {
                anyhow::bail!("hops must not be empty");
            }
            if hops.len() > MAX_HOPS {
                anyhow::bail!("hops exceeds max allowed length ({MAX_HOPS})");
            }
            let as_of = parse_as_of(args.get("as_of"))?;

            match state.kb.related(subject, entity_type, &hops, as_of)? {
                None => Ok(json!({
                    "content": [{ "type": "text", "text": format!("no known entity {subject:?} of type {entity_type:?}") }],
                    "structuredContent": { "found": false }
                })),
                Some(entities) => Ok(json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{} related entit(ies)", entities.len())
                    }],
                    "structuredContent": { "found": true, "entities": entities }
                })),
            }
        }
        "list_predicates" => {
            let predicates = state.kb.predicates();
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} predicate(s)", predicates.len()) }],
                "structuredContent": { "predicates": predicates }
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

fn required_name<'a>(args: &'a JsonValue, field: &str) -> Result<&'a str> {
    let value = args
        .get(field)
        .and_then(JsonValue::as_str)
        .with_context(|| format!("{field} is required"))?;
    if value.len() > MAX_NAME_BYTES {
        anyhow::bail!("{field} exceeds max allowed size ({MAX_NAME_BYTES} bytes)");
    }
    Ok(value)
}

fn parse_as_of(v: Option<&JsonValue>) -> Result<Option<DateTime<Utc>>> {
    match v.and_then(JsonValue::as_str) {
        Some(s) => Ok(Some(
            s.parse::<DateTime<Utc>>().context("as_of must be RFC3339")?,
        )),
        None => Ok(None),
    }
}
