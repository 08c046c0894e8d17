//! The static tool catalog exposed over `tools/list`.

use serde_json::{Value, json};

pub(crate) struct ToolSpec {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) input_schema: Value,
    pub(crate) output_schema: Value,
}

impl ToolSpec {
    pub(crate) fn to_listing(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "outputSchema": self.output_schema,
        })
    }
}

fn string_prop(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn common_props(mut props: serde_json::Map<String, Value>) -> Value {
    props.insert(
        "maxTokens".to_string(),
        json!({ "type": "integer", "minimum": 1, "maximum": 65536, "description": "Token budget override" }),
    );
    props.insert(
        "temperature".to_string(),
        json!({ "type": "number", "minimum": 0.0, "maximum": 2.0, "description": "Sampling temperature override" }),
    );
    props.insert(
        "timeoutMs".to_string(),
        json!({ "type": "integer", "minimum": 1, "description": "Per-call deadline override in milliseconds" }),
    );
    Value::Object(props)
}

fn object_schema(props: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

/// Output shape of the single-task tools: the tool-specific result field
/// plus the provenance envelope.
fn single_output_schema(shape_key: &str) -> Value {
    let mut props = serde_json::Map::new();
    props.insert(shape_key.to_string(), json!({ "type": "string" }));
    props.insert("workerId".to_string(), json!({ "type": "string" }));
    props.insert("backend".to_string(), json!({ "type": "string" }));
    props.insert("model".to_string(), json!({ "type": "string" }));
    props.insert("latencyMs".to_string(), json!({ "type": "integer" }));
    props.insert("taskId".to_string(), json!({ "type": "integer" }));
    object_schema(Value::Object(props), &[shape_key, "workerId", "backend", "latencyMs"])
}

macro_rules! props {
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), $value);)*
        map
    }};
}

pub(crate) fn catalog() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "ruvltra_code_generate",
            description: "Generate code from a natural-language instruction.",
            input_schema: object_schema(
                common_props(props! {
                    "instruction" => string_prop("What to generate"),
                    "context" => string_prop("Surrounding code or documents"),
                    "language" => string_prop("Target programming language"),
                    "filePath" => string_prop("File the generated code belongs to"),
                }),
                &["instruction"],
            ),
            output_schema: single_output_schema("output"),
        },
        ToolSpec {
            name: "ruvltra_code_review",
            description: "Review code and report concrete issues with fixes.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Code to review"),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["code"],
            ),
            output_schema: single_output_schema("review"),
        },
        ToolSpec {
            name: "ruvltra_code_refactor",
            description: "Refactor code, optionally toward a stated goal.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Code to refactor"),
                    "instruction" => string_prop("Refactoring goal"),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["code"],
            ),
            output_schema: single_output_schema("refactored"),
        },
        ToolSpec {
            name: "ruvltra_code_explain",
            description: "Explain what code does, tuned to an audience.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Code to explain"),
                    "audience" => string_prop("Who the explanation is for (default: developer)"),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["code"],
            ),
            output_schema: single_output_schema("explanation"),
        },
        ToolSpec {
            name: "ruvltra_code_test",
            description: "Write unit tests for code.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Code under test"),
                    "framework" => string_prop("Test framework to use"),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["code"],
            ),
            output_schema: single_output_schema("tests"),
        },
        ToolSpec {
            name: "ruvltra_code_fix",
            description: "Fix code that fails with a given error.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Failing code"),
                    "error" => string_prop("Error message or failure description"),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["code", "error"],
            ),
            output_schema: single_output_schema("fix"),
        },
        ToolSpec {
            name: "ruvltra_code_complete",
            description: "Continue code from a prefix.",
            input_schema: object_schema(
                common_props(props! {
                    "prefix" => string_prop("Code to continue from"),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["prefix"],
            ),
            output_schema: single_output_schema("completion"),
        },
        ToolSpec {
            name: "ruvltra_code_translate",
            description: "Translate code to another programming language.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Code to translate"),
                    "targetLanguage" => string_prop("Language to translate into"),
                }),
                &["code", "targetLanguage"],
            ),
            output_schema: single_output_schema("translated"),
        },
        ToolSpec {
            name: "ruvltra_parallel_generate",
            description: "Run several independent generation tasks concurrently.",
            input_schema: object_schema(
                common_props(props! {
                    "tasks" => json!({
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "filePath": { "type": "string" },
                                "instruction": { "type": "string" },
                                "context": { "type": "string" },
                                "language": { "type": "string" },
                            },
                            "required": ["instruction"],
                        },
                        "description": "Independent generation tasks",
                    }),
                }),
                &["tasks"],
            ),
            output_schema: object_schema(
                json!({
                    "totalTasks": { "type": "integer" },
                    "totalLatencyMs": { "type": "integer" },
                    "results": { "type": "array", "items": { "type": "object" } },
                }),
                &["totalTasks", "totalLatencyMs", "results"],
            ),
        },
        ToolSpec {
            name: "ruvltra_swarm_review",
            description: "Review code from several perspectives concurrently.",
            input_schema: object_schema(
                common_props(props! {
                    "code" => string_prop("Code to review"),
                    "perspectives" => json!({
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Review perspectives (default: security, performance, quality, maintainability; capped at 8)",
                    }),
                    "language" => string_prop("Programming language of the code"),
                }),
                &["code"],
            ),
            output_schema: object_schema(
                json!({
                    "perspectives": { "type": "array", "items": { "type": "string" } },
                    "totalLatencyMs": { "type": "integer" },
                    "reviews": { "type": "array", "items": { "type": "object" } },
                }),
                &["perspectives", "totalLatencyMs", "reviews"],
            ),
        },
        ToolSpec {
            name: "ruvltra_status",
            description: "Snapshot of the worker pool: workers, queue, counters, backends.",
            input_schema: object_schema(json!({}), &[]),
            output_schema: object_schema(
                json!({ "status": { "type": "object" } }),
                &["status"],
            ),
        },
        ToolSpec {
            name: "ruvltra_sona_stats",
            description: "Pattern-memory stats, for one worker or all.",
            input_schema: object_schema(
                json!({ "workerId": { "type": "string", "description": "Restrict to one worker" } }),
                &[],
            ),
            output_schema: object_schema(
                json!({ "sona": { "type": "array", "items": { "type": "object" } } }),
                &["sona"],
            ),
        },
        ToolSpec {
            name: "ruvltra_scale_workers",
            description: "Resize the worker pool (clamped to configured bounds).",
            input_schema: object_schema(
                json!({ "target": { "type": "integer", "minimum": 0, "description": "Desired worker count" } }),
                &["target"],
            ),
            output_schema: object_schema(
                json!({ "status": { "type": "object" } }),
                &["status"],
            ),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique_and_prefixed() {
        let tools = catalog();
        assert_eq!(tools.len(), 13);
        let mut names: Vec<&str> = tools.iter().map(|t| t.name).collect();
        assert!(names.iter().all(|n| n.starts_with("ruvltra_")));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 13);
    }

    #[test]
    fn schemas_declare_required_fields() {
        let tools = catalog();
        let fix = tools.iter().find(|t| t.name == "ruvltra_code_fix").unwrap();
        let required = fix.input_schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "code"));
        assert!(required.iter().any(|v| v == "error"));
    }

    #[test]
    fn every_tool_advertises_an_output_shape() {
        for tool in catalog() {
            assert_eq!(tool.output_schema["type"], "object", "{}", tool.name);
        }
    }
}
