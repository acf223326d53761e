//! Anthropic SSE fixture builders for integration tests.

#![allow(dead_code)]

use wiremock::ResponseTemplate;

fn message_start() -> String {
    r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude-test","stop_reason":null,"usage":{"input_tokens":10,"output_tokens":1}}}"#
        .to_string()
}

fn text_block(index: usize, text: &str) -> Vec<String> {
    vec![
        format!(
            r#"event: content_block_start
data: {{"type":"content_block_start","index":{index},"content_block":{{"type":"text","text":""}}}}"#
        ),
        format!(
            r#"event: content_block_delta
data: {{"type":"content_block_delta","index":{index},"delta":{{"type":"text_delta","text":"{}"}}}}"#,
            escape_json(text)
        ),
        format!(
            r#"event: content_block_stop
data: {{"type":"content_block_stop","index":{index}}}"#
        ),
    ]
}

fn tool_block(index: usize, id: &str, name: &str, input_json: &str) -> Vec<String> {
    vec![
        format!(
            r#"event: content_block_start
data: {{"type":"content_block_start","index":{index},"content_block":{{"type":"tool_use","id":"{id}","name":"{name}","input":{{}}}}}}"#
        ),
        format!(
            r#"event: content_block_delta
data: {{"type":"content_block_delta","index":{index},"delta":{{"type":"input_json_delta","partial_json":"{}"}}}}"#,
            escape_json(input_json)
        ),
        format!(
            r#"event: content_block_stop
data: {{"type":"content_block_stop","index":{index}}}"#
        ),
    ]
}

fn finish(events: &mut Vec<String>, stop_reason: &str) -> String {
    events.push(format!(
        r#"event: message_delta
data: {{"type":"message_delta","delta":{{"stop_reason":"{stop_reason}"}},"usage":{{"output_tokens":5}}}}"#
    ));
    events.push(
        r#"event: message_stop
data: {"type":"message_stop"}"#
            .to_string(),
    );
    events.join("\n\n") + "\n\n"
}

/// A plain text answer.
pub fn text_sse(text: &str) -> String {
    let mut events = vec![message_start()];
    events.extend(text_block(0, text));
    finish(&mut events, "end_turn")
}

/// A turn requesting one or more tools: `(id, name, input_json)`.
pub fn tool_use_sse(calls: &[(&str, &str, &str)]) -> String {
    let mut events = vec![message_start()];
    for (index, (id, name, input)) in calls.iter().enumerate() {
        events.extend(tool_block(index, id, name, input));
    }
    finish(&mut events, "tool_use")
}

/// An `error` event in the middle of a stream.
pub fn error_sse(error_type: &str, message: &str) -> String {
    let events = [
        message_start(),
        format!(
            r#"event: error
data: {{"type":"error","error":{{"type":"{error_type}","message":"{}"}}}}"#,
            escape_json(message)
        ),
    ];
    events.join("\n\n") + "\n\n"
}

pub fn sse_response(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body.to_string())
}

fn escape_json(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}
