//! JSON Schema for templates.
//!
//! Raw template input is checked against this schema before it is
//! deserialized, so authors get every violated field at once (with its
//! instance path) instead of serde's first-error-wins message.

use promptloom_core::{SchemaError, SchemaViolation};
use serde_json::{Value, json};

/// The template schema (draft 2020-12).
pub fn template_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "promptloom template",
        "type": "object",
        "required": ["id", "name", "version", "layout"],
        "additionalProperties": false,
        "properties": {
            "id": {"type": "string", "minLength": 1},
            "task": {"type": "string"},
            "name": {"type": "string"},
            "version": {"type": "integer", "minimum": 0},
            "layout": {"type": "array", "items": {"$ref": "#/$defs/layoutNode"}},
            "slots": {
                "type": "object",
                "additionalProperties": {"$ref": "#/$defs/slot"}
            },
            "attachments": {"type": "array", "items": {"$ref": "#/$defs/lane"}}
        },
        "$defs": {
            "role": {"enum": ["system", "user", "assistant"]},
            "tokens": {"type": "integer", "minimum": 0},
            "frame": {
                "type": "object",
                "required": ["content"],
                "additionalProperties": false,
                "properties": {
                    "role": {"$ref": "#/$defs/role"},
                    "content": {"type": "string"}
                }
            },
            "dataRef": {
                "type": ["string", "object"],
                "minLength": 1,
                "additionalProperties": false,
                "properties": {
                    "source": {"type": "string", "minLength": 1},
                    "args": {},
                    "path": {"type": "string", "minLength": 1}
                },
                "anyOf": [
                    {"type": "string"},
                    {"required": ["source"]},
                    {"required": ["path"]}
                ]
            },
            "layoutNode": {
                "type": "object",
                "required": ["kind"],
                "properties": {"kind": {"enum": ["message", "slot"]}},
                "allOf": [
                    {
                        "if": {"required": ["kind"], "properties": {"kind": {"const": "message"}}},
                        "then": {"$ref": "#/$defs/layoutMessage"}
                    },
                    {
                        "if": {"required": ["kind"], "properties": {"kind": {"const": "slot"}}},
                        "then": {"$ref": "#/$defs/layoutSlot"}
                    }
                ]
            },
            "layoutMessage": {
                "required": ["role"],
                "additionalProperties": false,
                "properties": {
                    "kind": true,
                    "role": {"$ref": "#/$defs/role"},
                    "content": {"type": "string"},
                    "from": {"$ref": "#/$defs/dataRef"},
                    "prefix": {"type": "boolean"},
                    "anchor": {"type": "string", "minLength": 1}
                }
            },
            "layoutSlot": {
                "required": ["name"],
                "additionalProperties": false,
                "properties": {
                    "kind": true,
                    "name": {"type": "string", "minLength": 1},
                    "header": {"$ref": "#/$defs/frame"},
                    "footer": {"$ref": "#/$defs/frame"},
                    "omitIfEmpty": {"type": "boolean"}
                }
            },
            "slot": {
                "type": "object",
                "required": ["plan"],
                "additionalProperties": false,
                "properties": {
                    "priority": {"type": "integer"},
                    "when": {"$ref": "#/$defs/condition"},
                    "budget": {"$ref": "#/$defs/tokens"},
                    "plan": {"$ref": "#/$defs/plan"},
                    "meta": {}
                }
            },
            "plan": {"type": "array", "items": {"$ref": "#/$defs/planNode"}},
            "planNode": {
                "type": "object",
                "required": ["kind"],
                "properties": {"kind": {"enum": ["message", "forEach", "if"]}},
                "allOf": [
                    {
                        "if": {"required": ["kind"], "properties": {"kind": {"const": "message"}}},
                        "then": {"$ref": "#/$defs/planMessage"}
                    },
                    {
                        "if": {"required": ["kind"], "properties": {"kind": {"const": "forEach"}}},
                        "then": {"$ref": "#/$defs/forEach"}
                    },
                    {
                        "if": {"required": ["kind"], "properties": {"kind": {"const": "if"}}},
                        "then": {"$ref": "#/$defs/ifNode"}
                    }
                ]
            },
            "planMessage": {
                "required": ["role"],
                "additionalProperties": false,
                "properties": {
                    "kind": true,
                    "role": {"$ref": "#/$defs/role"},
                    "content": {"type": "string"},
                    "from": {"$ref": "#/$defs/dataRef"},
                    "anchor": {"type": "string", "minLength": 1},
                    "budget": {"$ref": "#/$defs/tokens"}
                }
            },
            "forEach": {
                "required": ["source", "map"],
                "additionalProperties": false,
                "properties": {
                    "kind": true,
                    "source": {"$ref": "#/$defs/dataRef"},
                    "order": {"enum": ["asc", "desc"]},
                    "sortBy": {"type": "string", "minLength": 1},
                    "limit": {"type": "integer", "minimum": 0},
                    "fillDir": {"enum": ["append", "prepend"]},
                    "map": {"$ref": "#/$defs/plan"},
                    "interleave": {"$ref": "#/$defs/frame"},
                    "budget": {"$ref": "#/$defs/tokens"},
                    "stopWhenOutOfBudget": {"type": "boolean"}
                }
            },
            "ifNode": {
                "required": ["condition", "then"],
                "additionalProperties": false,
                "properties": {
                    "kind": true,
                    "condition": {"$ref": "#/$defs/condition"},
                    "then": {"$ref": "#/$defs/plan"},
                    "else": {"$ref": "#/$defs/plan"}
                }
            },
            "condition": {
                "type": "object",
                "required": ["type"],
                "properties": {
                    "type": {"enum": ["exists", "nonEmpty", "compare", "expr", "all", "any", "not"]}
                },
                "allOf": [
                    {
                        "if": {"required": ["type"], "properties": {"type": {"enum": ["exists", "nonEmpty"]}}},
                        "then": {
                            "required": ["ref"],
                            "additionalProperties": false,
                            "properties": {"type": true, "ref": {"$ref": "#/$defs/dataRef"}}
                        }
                    },
                    {
                        "if": {"required": ["type"], "properties": {"type": {"const": "compare"}}},
                        "then": {
                            "required": ["ref", "op", "value"],
                            "additionalProperties": false,
                            "properties": {
                                "type": true,
                                "ref": {"$ref": "#/$defs/dataRef"},
                                "op": {"enum": ["eq", "ne", "lt", "lte", "gt", "gte"]},
                                "value": {}
                            }
                        }
                    },
                    {
                        "if": {"required": ["type"], "properties": {"type": {"const": "expr"}}},
                        "then": {
                            "required": ["expr"],
                            "additionalProperties": false,
                            "properties": {"type": true, "expr": {"type": "string", "minLength": 1}}
                        }
                    },
                    {
                        "if": {"required": ["type"], "properties": {"type": {"enum": ["all", "any"]}}},
                        "then": {
                            "required": ["conditions"],
                            "additionalProperties": false,
                            "properties": {
                                "type": true,
                                "conditions": {"type": "array", "items": {"$ref": "#/$defs/condition"}}
                            }
                        }
                    },
                    {
                        "if": {"required": ["type"], "properties": {"type": {"const": "not"}}},
                        "then": {
                            "required": ["condition"],
                            "additionalProperties": false,
                            "properties": {"type": true, "condition": {"$ref": "#/$defs/condition"}}
                        }
                    }
                ]
            },
            "lane": {
                "type": "object",
                "required": ["id", "role", "template"],
                "additionalProperties": false,
                "properties": {
                    "id": {"type": "string", "minLength": 1},
                    "enabled": {"type": "boolean"},
                    "role": {"$ref": "#/$defs/role"},
                    "template": {"type": "string"},
                    "order": {"type": "integer"},
                    "groups": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["id"],
                            "additionalProperties": false,
                            "properties": {
                                "id": {"type": "string", "minLength": 1},
                                "open": {"type": "string"},
                                "close": {"type": "string"}
                            }
                        }
                    },
                    "reserveTokens": {"$ref": "#/$defs/tokens"}
                }
            }
        }
    })
}

fn compile_validator(schema: &Value) -> Result<jsonschema::Validator, SchemaError> {
    jsonschema::validator_for(schema).map_err(|e| SchemaError::InvalidSchema(e.to_string()))
}

/// Validate raw template JSON, reporting every violation.
pub fn validate_template(raw: &Value) -> Result<(), SchemaError> {
    let validator = compile_validator(&template_schema())?;

    let violations: Vec<SchemaViolation> = validator
        .iter_errors(raw)
        .map(|e| SchemaViolation {
            path: e.instance_path().to_string(),
            message: e.to_string(),
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        tracing::debug!(count = violations.len(), "template failed schema validation");
        Err(SchemaError::Violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Value {
        json!({
            "id": "t",
            "name": "T",
            "version": 1,
            "layout": [
                {"kind": "message", "role": "system", "content": "Intro"},
                {"kind": "slot", "name": "timeline", "header": {"content": "History"}}
            ],
            "slots": {
                "timeline": {
                    "priority": 1,
                    "when": {"type": "nonEmpty", "ref": "turns"},
                    "plan": [{
                        "kind": "forEach",
                        "source": {"source": "turns", "args": {"limit": 3}},
                        "map": [{
                            "kind": "if",
                            "condition": {"type": "compare", "ref": {"path": "item.n"}, "op": "gt", "value": 1},
                            "then": [{"kind": "message", "role": "user", "content": "{{item.text}}"}]
                        }]
                    }]
                }
            },
            "attachments": [
                {"id": "lore", "role": "system", "template": "{{payload}}", "groups": [{"id": "g", "open": "<"}]}
            ]
        })
    }

    #[test]
    fn schema_itself_compiles() {
        assert!(compile_validator(&template_schema()).is_ok());
    }

    #[test]
    fn broken_schema_is_not_reported_as_bad_input() {
        let Err(err) = compile_validator(&json!({"type": 12})) else {
            panic!("an invalid schema should not compile");
        };
        assert!(matches!(err, SchemaError::InvalidSchema(_)));
        assert!(err.violations().is_empty());
        assert!(err.to_string().starts_with("built-in template schema failed to compile"));
    }

    #[test]
    fn accepts_a_complete_template() {
        validate_template(&minimal()).unwrap();
    }

    #[test]
    fn reports_every_violation() {
        let mut raw = minimal();
        raw["version"] = json!("one");
        raw["layout"][0]["role"] = json!("narrator");
        raw["slots"]["timeline"]["plan"][0]["order"] = json!("sideways");

        let err = validate_template(&raw).unwrap_err();
        let paths: Vec<&str> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"/version"), "{paths:?}");
        assert!(paths.contains(&"/layout/0/role"), "{paths:?}");
        assert!(paths.contains(&"/slots/timeline/plan/0/order"), "{paths:?}");
    }

    #[test]
    fn rejects_unknown_fields_and_kinds() {
        let mut raw = minimal();
        raw["layout"][0]["colour"] = json!("red");
        raw["layout"][1]["kind"] = json!("banner");

        let err = validate_template(&raw).unwrap_err();
        assert!(err.violations().len() >= 2);
        assert!(err.violations().iter().any(|v| v.path == "/layout/1/kind"));
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let err = validate_template(&json!({"layout": []})).unwrap_err();
        // id, name and version are reported together at the root.
        assert!(err.violations().len() >= 3);
        assert!(err.violations().iter().all(|v| v.path.is_empty()));
    }

    #[test]
    fn condition_shapes_are_checked() {
        let mut raw = minimal();
        raw["slots"]["timeline"]["when"] = json!({"type": "compare", "ref": "turns"});
        let err = validate_template(&raw).unwrap_err();
        assert!(
            err.violations()
                .iter()
                .any(|v| v.path == "/slots/timeline/when")
        );
    }
}
