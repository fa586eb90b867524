//! Best-effort repair of job payloads whose quotes were eaten by the shell.
//!
//! `{id:job1,command:echo hi,max_retries:2}` becomes
//! `{"id":"job1","command":"echo hi","max_retries":2}`. Only flat objects are
//! handled: values containing `,`, `}` or `[` are not recovered. Strict JSON
//! parsing stays the default; this runs only when asked for.

use regex::{Captures, Regex};

/// Quote bare keys and bare string values
pub fn normalize(input: &str) -> Result<String, regex::Error> {
    let bare_key = Regex::new(r"([{,]\s*)([A-Za-z0-9_@.-]+)\s*:")?;
    let bare_value = Regex::new(r":\s*([^,}\[]+)([,}])")?;

    let quoted_keys = bare_key.replace_all(input.trim(), r#"$1"$2":"#);
    let normalized = bare_value.replace_all(&quoted_keys, |caps: &Captures| {
        format!(":{}{}", quote_value(caps[1].trim()), &caps[2])
    });

    Ok(normalized.into_owned())
}

fn quote_value(raw: &str) -> String {
    if raw.is_empty() {
        return r#""""#.to_string();
    }
    let already_structured = raw.starts_with(['"', '\'', '[', '{']);
    let literal = matches!(raw, "true" | "false" | "null")
        || raw.parse::<f64>().is_ok_and(f64::is_finite);
    if already_structured || literal {
        return raw.to_string();
    }
    format!("\"{}\"", raw.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(input: &str) -> Value {
        serde_json::from_str(&normalize(input).unwrap()).unwrap()
    }

    #[test]
    fn test_quotes_bare_keys_and_values() {
        assert_eq!(
            parse("{id:job1,command:echo hi}"),
            json!({"id": "job1", "command": "echo hi"})
        );
    }

    #[test]
    fn test_leaves_literals_alone() {
        assert_eq!(
            parse("{command:sleep 1, max_retries:2, backoff_base:1.5, save_output:true, run_at:null}"),
            json!({
                "command": "sleep 1",
                "max_retries": 2,
                "backoff_base": 1.5,
                "save_output": true,
                "run_at": null
            })
        );
    }

    #[test]
    fn test_already_valid_json_survives() {
        let input = r#"{"command":"echo ok","priority":3}"#;
        assert_eq!(parse(input), json!({"command": "echo ok", "priority": 3}));
    }

    #[test]
    fn test_escapes_inner_quotes() {
        assert_eq!(
            parse(r#"{command:echo say"hi}"#),
            json!({"command": "echo say\"hi"})
        );
    }
}
