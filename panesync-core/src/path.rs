use std::{fmt, str::FromStr};

use serde_json::{Map, Value};

use crate::{CoreError, StatePatch};

/// Largest array index a field path may address. `set` pads arrays up to the
/// index, so an unbounded index would let a single patch allocate at will.
pub const MAX_PATH_INDEX: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    fn empty_container(&self) -> Value {
        match self {
            Segment::Key(_) => Value::Object(Map::new()),
            Segment::Index(_) => Value::Array(Vec::new()),
        }
    }
}

/// A parsed field path into store state, e.g. `friendInfo.id`,
/// `members[2].name` or `drafts["room.1"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Ok(Self {
            raw: raw.to_owned(),
            segments: parse_segments(raw)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn get<'a>(&self, state: &'a Value) -> Option<&'a Value> {
        let mut cursor = state;
        for segment in &self.segments {
            cursor = match segment {
                Segment::Key(key) => cursor.as_object()?.get(key)?,
                Segment::Index(index) => cursor.as_array()?.get(*index)?,
            };
        }
        Some(cursor)
    }

    /// Writes `value` at this path, creating missing objects and arrays on
    /// the way. Arrays are padded with `null` up to the addressed index.
    pub fn set(&self, state: &mut Value, value: Value) -> Result<(), CoreError> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Err(self.conflict());
        };

        let mut cursor = state;
        for segment in parents {
            if cursor.is_null() {
                *cursor = segment.empty_container();
            }
            cursor = match (segment, cursor) {
                (Segment::Key(key), Value::Object(map)) => {
                    map.entry(key.clone()).or_insert(Value::Null)
                }
                (Segment::Index(index), Value::Array(items)) => {
                    if items.len() <= *index {
                        items.resize(*index + 1, Value::Null);
                    }
                    &mut items[*index]
                }
                _ => return Err(self.conflict()),
            };
        }

        if cursor.is_null() {
            *cursor = last.empty_container();
        }
        match (last, cursor) {
            (Segment::Key(key), Value::Object(map)) => {
                map.insert(key.clone(), value);
            }
            (Segment::Index(index), Value::Array(items)) => {
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                items[*index] = value;
            }
            _ => return Err(self.conflict()),
        }
        Ok(())
    }

    fn conflict(&self) -> CoreError {
        CoreError::PathConflict {
            path: self.raw.clone(),
        }
    }
}

impl FromStr for FieldPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn get_path<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    FieldPath::parse(path).ok()?.get(state)
}

pub fn set_path(state: &mut Value, path: &str, value: Value) -> Result<(), CoreError> {
    FieldPath::parse(path)?.set(state, value)
}

/// Collects the current value of every path that resolves in `state`.
/// Paths that do not resolve are left out rather than sent as `null`.
pub fn extract_patch(state: &Value, paths: &[FieldPath]) -> StatePatch {
    paths
        .iter()
        .filter_map(|path| {
            path.get(state)
                .map(|value| (path.as_str().to_owned(), value.clone()))
        })
        .collect()
}

/// Applies every entry of `patch` to `state`, interpreting keys as field
/// paths. Stops at the first entry that cannot be applied.
pub fn apply_patch(state: &mut Value, patch: &StatePatch) -> Result<(), CoreError> {
    for (path, value) in patch {
        set_path(state, path, value.clone())?;
    }
    Ok(())
}

fn parse_segments(path: &str) -> Result<Vec<Segment>, CoreError> {
    let invalid = |reason: &str| CoreError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };

    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }

    let chars: Vec<char> = path.chars().collect();
    let mut segments = Vec::new();
    let mut key = String::new();
    let mut after_bracket = false;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if key.is_empty() {
                    if !after_bracket {
                        return Err(invalid("empty segment"));
                    }
                } else {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                if matches!(chars.get(i + 1), None | Some('.') | Some('[')) {
                    return Err(invalid("empty segment"));
                }
                after_bracket = false;
                i += 1;
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut key)));
                }
                let (segment, next) = parse_bracket(&chars, i + 1).map_err(|r| invalid(r))?;
                segments.push(segment);
                if !matches!(chars.get(next), None | Some('.') | Some('[')) {
                    return Err(invalid("unexpected character after ']'"));
                }
                after_bracket = true;
                i = next;
            }
            ']' => return Err(invalid("unbalanced ']'")),
            c => {
                key.push(c);
                i += 1;
            }
        }
    }

    if !key.is_empty() {
        segments.push(Segment::Key(key));
    }
    Ok(segments)
}

/// Parses bracket content starting right after `[`. Returns the segment and
/// the index just past the closing `]`.
fn parse_bracket(chars: &[char], start: usize) -> Result<(Segment, usize), &'static str> {
    match chars.get(start) {
        Some(&quote) if quote == '"' || quote == '\'' => {
            let close = chars[start + 1..]
                .iter()
                .position(|c| *c == quote)
                .map(|offset| start + 1 + offset)
                .ok_or("unterminated quote")?;
            if chars.get(close + 1) != Some(&']') {
                return Err("unterminated '['");
            }
            let key: String = chars[start + 1..close].iter().collect();
            Ok((Segment::Key(key), close + 2))
        }
        Some(_) => {
            let close = chars[start..]
                .iter()
                .position(|c| *c == ']')
                .map(|offset| start + offset)
                .ok_or("unterminated '['")?;
            let content: String = chars[start..close].iter().collect();
            let index: usize = content
                .trim()
                .parse()
                .map_err(|_| "bracket index must be numeric or quoted")?;
            if index > MAX_PATH_INDEX {
                return Err("bracket index too large");
            }
            Ok((Segment::Index(index), close + 1))
        }
        None => Err("unterminated '['"),
    }
}
