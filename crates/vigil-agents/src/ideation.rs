use serde::{Deserialize, Serialize};

/// Structured marker printed by ideation and roadmap runners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamSignal {
    UnitComplete { unit: String, count: u32 },
    UnitFailed { unit: String },
    Progress { percent: u8 },
}

const UNIT_COMPLETE: &str = "IDEATION_TYPE_COMPLETE:";
const UNIT_FAILED: &str = "IDEATION_TYPE_FAILED:";
const PROGRESS: &str = "PROGRESS:";

/// Recognise one streaming marker on a single line of output.
pub fn parse_stream_signal(line: &str) -> Option<StreamSignal> {
    let line = line.trim();

    if let Some(rest) = find_after(line, UNIT_COMPLETE) {
        let (unit, count) = rest.split_once(':')?;
        let unit = unit.trim();
        if unit.is_empty() {
            return None;
        }
        let count = count
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0);
        return Some(StreamSignal::UnitComplete {
            unit: unit.to_string(),
            count,
        });
    }

    if let Some(rest) = find_after(line, UNIT_FAILED) {
        let unit = rest.trim();
        if unit.is_empty() {
            return None;
        }
        return Some(StreamSignal::UnitFailed {
            unit: unit.to_string(),
        });
    }

    let rest = find_after(line, PROGRESS)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let percent: u32 = digits.parse().ok()?;
    Some(StreamSignal::Progress {
        percent: percent.min(100) as u8,
    })
}

/// All markers in a multi-line chunk, in order.
pub fn parse_stream_signals(chunk: &str) -> Vec<StreamSignal> {
    chunk.lines().filter_map(parse_stream_signal).collect()
}

fn find_after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|index| &line[index + marker.len()..])
}
