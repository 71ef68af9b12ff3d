use super::chat_template::ChatTemplateConfig;
use crate::{
    cache::download,
    value::{
        FinishReason, MessageDelta, MessageDeltaOutput, PartDelta, PartDeltaFunction, Role,
    },
};

/// Whether the accumulated decode text still sits inside a multi-byte
/// character (or a run of them, as emoji sequences decode piecewise).
///
/// The tokenizer substitutes U+FFFD for byte sequences it cannot yet complete;
/// emission is deferred until the trailing run of replacement characters has a
/// length divisible by four.
pub(crate) fn utf8_boundary_pending(s: &str) -> bool {
    let trailing = s
        .chars()
        .rev()
        .take_while(|c| *c == '\u{FFFD}')
        .count();
    trailing % 4 != 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    OutputText,
    Reasoning,
    ToolCall,
}

/// Classifies decoded token text into reasoning, content and tool-call spans
/// and emits structured deltas.
///
/// Same input sequence, same output: ids derive from a per-parser counter and
/// the call payload, never from ambient randomness.
#[derive(Debug)]
pub(crate) struct TokenStreamParser {
    config: ChatTemplateConfig,
    state: ParseState,
    tool_call_buffer: String,
    calls_emitted: usize,
    last_piece: String,
    done: bool,
}

impl TokenStreamParser {
    pub fn new(config: ChatTemplateConfig) -> Self {
        Self {
            config,
            state: ParseState::OutputText,
            tool_call_buffer: String::new(),
            calls_emitted: 0,
            last_piece: String::new(),
            done: false,
        }
    }

    fn call_id(&self, payload: &str) -> String {
        format!(
            "call-{}-{}",
            self.calls_emitted,
            &download::sha1_hex(payload.as_bytes())[..8]
        )
    }

    /// Feed one decoded token text; returns the deltas it produces (possibly
    /// none: marker tokens and swallowed whitespace emit nothing).
    pub fn push(&mut self, piece: &str) -> Vec<MessageDeltaOutput> {
        if self.done {
            return Vec::new();
        }

        // The template renders a newline after a closed tool call; the model
        // replays it. Not content.
        if self.last_piece == self.config.tool_call_close && piece == "\n" {
            return Vec::new();
        }
        self.last_piece = piece.to_owned();

        match self.state {
            ParseState::OutputText => {
                if piece == self.config.eos {
                    self.done = true;
                    vec![MessageDeltaOutput::finish(FinishReason::Stop)]
                } else if piece == self.config.reasoning_open {
                    self.state = ParseState::Reasoning;
                    Vec::new()
                } else if piece == self.config.tool_call_open {
                    self.state = ParseState::ToolCall;
                    self.tool_call_buffer.clear();
                    Vec::new()
                } else {
                    vec![MessageDeltaOutput::delta(
                        MessageDelta::new()
                            .with_role(Role::Assistant)
                            .with_contents([PartDelta::Text {
                                text: piece.to_owned(),
                            }]),
                    )]
                }
            }
            ParseState::Reasoning => {
                if piece == self.config.reasoning_close {
                    self.state = ParseState::OutputText;
                    Vec::new()
                } else {
                    vec![MessageDeltaOutput::delta(
                        MessageDelta::new()
                            .with_role(Role::Assistant)
                            .with_reasoning(piece),
                    )]
                }
            }
            ParseState::ToolCall => {
                if piece == self.config.tool_call_close {
                    self.state = ParseState::OutputText;
                    let payload = std::mem::take(&mut self.tool_call_buffer);
                    match serde_json::from_str::<serde_json::Value>(payload.trim()) {
                        Ok(parsed) => {
                            let name = parsed
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_owned();
                            let arguments = parsed
                                .get("arguments")
                                .cloned()
                                .unwrap_or(serde_json::Value::Null);
                            let id = self.call_id(&payload);
                            self.calls_emitted += 1;
                            vec![MessageDeltaOutput {
                                delta: MessageDelta::new()
                                    .with_role(Role::Assistant)
                                    .with_tool_calls([PartDelta::Function {
                                        id: Some(id),
                                        function: PartDeltaFunction::Parsed { name, arguments },
                                    }]),
                                finish_reason: Some(FinishReason::ToolCalls),
                            }]
                        }
                        Err(e) => {
                            self.done = true;
                            vec![MessageDeltaOutput::finish(FinishReason::Error {
                                message: format!("malformed tool call payload: {}", e),
                            })]
                        }
                    }
                } else {
                    self.tool_call_buffer.push_str(piece);
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use yare::parameterized;

    use super::*;
    use crate::value::Delta as _;

    fn feed(parser: &mut TokenStreamParser, pieces: &[&str]) -> Vec<MessageDeltaOutput> {
        pieces.iter().flat_map(|p| parser.push(p)).collect()
    }

    #[test]
    fn reasoning_then_content_then_stop() {
        // One reasoning delta, one content delta, one stop. Marker tokens
        // emit nothing, so three emissions total.
        let mut parser = TokenStreamParser::new(ChatTemplateConfig::default());
        let outputs = feed(
            &mut parser,
            &["<think>", "hi", "</think>", "hello", "<|im_end|>"],
        );
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].delta.reasoning.as_deref(), Some("hi"));
        assert_eq!(
            outputs[1].delta.contents[0].clone().to_text().as_deref(),
            Some("hello")
        );
        assert_eq!(outputs[2].finish_reason, Some(FinishReason::Stop));
        assert!(parser.done);
    }

    #[test]
    fn tool_call_spans_parse_to_name_and_arguments() {
        let mut parser = TokenStreamParser::new(ChatTemplateConfig::default());
        let outputs = feed(
            &mut parser,
            &[
                "<tool_call>",
                "{\"name\": \"get_weather\",",
                " \"arguments\": {\"location\": \"Paris, France\"}}",
                "</tool_call>",
            ],
        );
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].finish_reason, Some(FinishReason::ToolCalls));
        let part = outputs[0].delta.tool_calls[0].clone().finish().unwrap();
        let (id, name, args) = part.as_function().unwrap();
        assert!(id.unwrap().starts_with("call-0-"));
        assert_eq!(name, "get_weather");
        assert_eq!(args, &json!({"location": "Paris, France"}));
    }

    #[test]
    fn same_stream_yields_identical_deltas() {
        let pieces = [
            "<think>", "weigh", " options", "</think>", "Sure", ", done.", "<tool_call>",
            "{\"name\": \"t\", \"arguments\": {}}", "</tool_call>",
        ];
        let mut a = TokenStreamParser::new(ChatTemplateConfig::default());
        let mut b = TokenStreamParser::new(ChatTemplateConfig::default());
        assert_eq!(feed(&mut a, &pieces), feed(&mut b, &pieces));
    }

    #[test]
    fn tool_call_round_trips_through_wire_form() {
        // Serialize a parsed call back to the template's wire form and
        // re-parse it: name and arguments survive.
        let mut parser = TokenStreamParser::new(ChatTemplateConfig::default());
        let outputs = feed(
            &mut parser,
            &[
                "<tool_call>",
                "{\"name\": \"get_weather\", \"arguments\": {\"location\": \"Paris, France\"}}",
                "</tool_call>",
            ],
        );
        let part = outputs[0].delta.tool_calls[0].clone().finish().unwrap();
        let (_, name, args) = part.as_function().unwrap();

        let wire = format!(
            "{}\n{}\n{}",
            "<tool_call>",
            serde_json::to_string(&json!({"name": name, "arguments": args})).unwrap(),
            "</tool_call>"
        );
        let mut reparser = TokenStreamParser::new(ChatTemplateConfig::default());
        let mut reparsed = Vec::new();
        for line in wire.split_inclusive('\n') {
            reparsed.extend(reparser.push(line.trim_end_matches('\n')));
        }
        let part2 = reparsed[0].delta.tool_calls[0].clone().finish().unwrap();
        let (_, name2, args2) = part2.as_function().unwrap();
        assert_eq!(name, name2);
        assert_eq!(args, args2);
    }

    #[test]
    fn malformed_tool_payload_terminates_with_error() {
        let mut parser = TokenStreamParser::new(ChatTemplateConfig::default());
        let outputs = feed(&mut parser, &["<tool_call>", "not json", "</tool_call>"]);
        assert!(matches!(
            outputs[0].finish_reason,
            Some(FinishReason::Error { .. })
        ));
        assert!(parser.done);
        assert!(parser.push("ignored").is_empty());
    }

    #[test]
    fn newline_after_closed_tool_call_is_swallowed() {
        let mut parser = TokenStreamParser::new(ChatTemplateConfig::default());
        feed(
            &mut parser,
            &["<tool_call>", "{\"name\":\"t\",\"arguments\":{}}", "</tool_call>"],
        );
        assert!(parser.push("\n").is_empty());
        assert!(!parser.push("text").is_empty());
    }

    #[test]
    fn custom_marker_tokens_are_honored() {
        let config = ChatTemplateConfig {
            eos: "<|endoftext|>".to_owned(),
            ..Default::default()
        };
        let mut parser = TokenStreamParser::new(config);
        let outputs = feed(&mut parser, &["ok", "<|endoftext|>"]);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].finish_reason, Some(FinishReason::Stop));
    }

    #[parameterized(
        clean = { "hello", false },
        one_pending = { "hello\u{FFFD}", true },
        three_pending = { "hello\u{FFFD}\u{FFFD}\u{FFFD}", true },
        full_run_emits = { "hello\u{FFFD}\u{FFFD}\u{FFFD}\u{FFFD}", false },
        interior_is_not_pending = { "he\u{FFFD}llo", false },
        empty = { "", false }
    )]
    fn replacement_runs_defer_until_a_clean_boundary(text: &str, pending: bool) {
        assert_eq!(utf8_boundary_pending(text), pending);
    }
}
