//! Parsing and checking model output, and the bounded feedback loop that
//! asks the model to correct itself.

use serde_json::{Map, Value};

/// Removes a surrounding Markdown code fence (```` ```json ```` or ```` ``` ````).
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parses a model response into JSON. The error is phrased as feedback for
/// the next attempt.
pub fn parse_response(content: &str) -> Result<Value, String> {
    let body = strip_code_fences(content);
    if body.is_empty() {
        return Err("The response was empty. Return a single JSON object.".to_string());
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("The response must be a single JSON object.".to_string()),
        Err(e) => Err(format!("The response was not valid JSON: {}", e)),
    }
}

/// Checks extracted data against the project's JSON schema.
pub struct OutputValidator {
    schema: Value,
    validator: jsonschema::Validator,
}

impl OutputValidator {
    pub fn new(schema: &Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self {
            schema: schema.clone(),
            validator,
        })
    }

    /// Schema violations plus required top-level fields that came back null.
    pub fn diagnostics(&self, data: &Value) -> Vec<String> {
        let mut problems: Vec<String> = self
            .validator
            .iter_errors(data)
            .map(|e| e.to_string())
            .collect();

        for field in self.missing_required(data) {
            let message = format!("required field '{}' is missing or null", field);
            if !problems.iter().any(|p| p.contains(&format!("\"{}\"", field))) {
                problems.push(message);
            }
        }
        problems
    }

    /// Top-level `required` properties that are absent or null.
    pub fn missing_required(&self, data: &Value) -> Vec<String> {
        let Some(required) = self.schema.get("required").and_then(Value::as_array) else {
            return Vec::new();
        };
        required
            .iter()
            .filter_map(Value::as_str)
            .filter(|field| matches!(lookup_path(data, field), None | Some(Value::Null)))
            .map(str::to_string)
            .collect()
    }
}

/// Looks up a dotted path (`vendor.name`) in a JSON object.
pub fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(data, |node, segment| node.as_object()?.get(segment))
}

/// Writes `value` at the dotted `field` path of `previous`, creating
/// intermediate objects. Anything that is not an object is replaced.
pub fn merge_field(previous: Option<Value>, field: &str, value: Value) -> Value {
    let mut root = match previous {
        Some(Value::Object(map)) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };

    let segments: Vec<&str> = field.split('.').collect();
    let mut node = &mut root;
    for (i, segment) in segments.iter().enumerate() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            break;
        };
        if i + 1 == segments.len() {
            map.insert((*segment).to_string(), value);
            break;
        }
        node = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    root
}

/// Bounded re-extraction loop state: how many attempts were made, what went
/// wrong each time, and the last response to correct.
#[derive(Debug, Clone)]
pub struct ReExtractState {
    max_attempts: u32,
    attempt: u32,
    feedback: Vec<String>,
    previous_response: Option<String>,
}

impl ReExtractState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt: 0,
            feedback: Vec::new(),
            previous_response: None,
        }
    }

    /// Starts the next attempt. Returns false once the budget is spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        self.attempt += 1;
        true
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    pub fn record_failure(&mut self, response: String, problems: Vec<String>) {
        self.previous_response = Some(response);
        self.feedback = problems;
    }

    pub fn feedback(&self) -> &[String] {
        &self.feedback
    }

    pub fn previous_response(&self) -> Option<&str> {
        self.previous_response.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fences() {
        let cases = [
            ("{\"a\":1}", "{\"a\":1}"),
            ("```json\n{\"a\":1}\n```", "{\"a\":1}"),
            ("```\n{\"a\":1}\n```\n", "{\"a\":1}"),
            ("  ```JSON\n{\"a\":1}```  ", "{\"a\":1}"),
        ];
        for (input, expected) in cases {
            assert_eq!(strip_code_fences(input), expected, "input: {:?}", input);
        }
    }

    #[test]
    fn test_parse_response_requires_object() {
        assert_eq!(parse_response("```json\n{\"total\": 5}\n```").unwrap(), json!({"total": 5}));
        assert!(parse_response("[1,2]").unwrap_err().contains("single JSON object"));
        assert!(parse_response("total: 5").unwrap_err().contains("not valid JSON"));
        assert!(parse_response("   ").unwrap_err().contains("empty"));
    }

    #[test]
    fn test_validator_reports_type_errors_and_missing_fields() {
        let schema = json!({
            "type": "object",
            "required": ["invoice_number", "total"],
            "properties": {
                "invoice_number": { "type": ["string", "null"] },
                "total": { "type": "number" }
            }
        });
        let validator = OutputValidator::new(&schema).unwrap();

        assert!(validator
            .diagnostics(&json!({ "invoice_number": "A-1", "total": 10.5 }))
            .is_empty());

        let problems = validator.diagnostics(&json!({ "invoice_number": null, "total": "ten" }));
        assert_eq!(problems.len(), 2, "{:?}", problems);
        assert!(problems.iter().any(|p| p.contains("number")));
        assert!(problems.iter().any(|p| p.contains("invoice_number")));
    }

    #[test]
    fn test_validator_rejects_bad_schema() {
        assert!(OutputValidator::new(&json!({ "type": 12 })).is_err());
    }

    #[test]
    fn test_merge_field_nested() {
        let merged = merge_field(
            Some(json!({ "total": 5, "vendor": { "name": "Old" } })),
            "vendor.name",
            json!("New"),
        );
        assert_eq!(merged, json!({ "total": 5, "vendor": { "name": "New" } }));

        let created = merge_field(None, "a.b", json!(1));
        assert_eq!(created, json!({ "a": { "b": 1 } }));

        let replaced = merge_field(Some(json!({ "a": 3 })), "a.b", json!(1));
        assert_eq!(replaced, json!({ "a": { "b": 1 } }));
    }

    #[test]
    fn test_reextract_state_is_bounded() {
        let mut state = ReExtractState::new(2);
        assert!(state.begin_attempt());
        assert!(!state.is_retry());
        state.record_failure("{}".into(), vec!["total missing".into()]);
        assert!(state.begin_attempt());
        assert!(state.is_retry());
        assert_eq!(state.feedback(), ["total missing".to_string()]);
        assert!(!state.begin_attempt());
        assert_eq!(state.attempt(), 2);
    }
}
