use serde::Serialize;

/// A single ledger mutation. Rendered as Redis argument vectors by
/// [`Command::to_args`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HIncrBy { key: String, field: String, delta: i64 },
    HIncrByFloat { key: String, field: String, delta: f64 },
    HSet { key: String, field: String, value: String },
    HDel { key: String, field: String },
    ZAdd { key: String, score: i64, member: String },
    SAdd { key: String, member: String },
    SMove { source: String, destination: String, member: String },
    /// Renames `from` to `to` when `from` exists; a missing source is a no-op.
    Rename { from: String, to: String },
    Del { keys: Vec<String> },
}

impl Command {
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Command::HIncrBy { key, field, delta } => {
                vec!["HINCRBY".into(), key.clone(), field.clone(), delta.to_string()]
            }
            Command::HIncrByFloat { key, field, delta } => vec![
                "HINCRBYFLOAT".into(),
                key.clone(),
                field.clone(),
                delta.to_string(),
            ],
            Command::HSet { key, field, value } => {
                vec!["HSET".into(), key.clone(), field.clone(), value.clone()]
            }
            Command::HDel { key, field } => vec!["HDEL".into(), key.clone(), field.clone()],
            Command::ZAdd { key, score, member } => {
                vec!["ZADD".into(), key.clone(), score.to_string(), member.clone()]
            }
            Command::SAdd { key, member } => vec!["SADD".into(), key.clone(), member.clone()],
            Command::SMove {
                source,
                destination,
                member,
            } => vec![
                "SMOVE".into(),
                source.clone(),
                destination.clone(),
                member.clone(),
            ],
            Command::Rename { from, to } => vec!["RENAME".into(), from.clone(), to.clone()],
            Command::Del { keys } => {
                let mut args = vec!["DEL".to_string()];
                args.extend(keys.iter().cloned());
                args
            }
        }
    }
}

/// Precondition checked atomically before any command of a batch runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// `member` must still belong to set `key`.
    Member { key: String, member: String },
    /// Hash field must hold exactly `value`, or be absent when `None`.
    Field {
        key: String,
        field: String,
        value: Option<String>,
    },
}

impl Guard {
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Guard::Member { key, member } => vec!["member".into(), key.clone(), member.clone()],
            Guard::Field { key, field, value } => {
                let mut args = vec!["field".into(), key.clone(), field.clone()];
                if let Some(value) = value {
                    args.push(value.clone());
                }
                args
            }
        }
    }
}

/// A group of commands applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub guards: Vec<Guard>,
    pub commands: Vec<Command>,
}

#[derive(Serialize)]
struct WireBatch {
    guards: Vec<Vec<String>>,
    commands: Vec<Vec<String>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn guard(&mut self, guard: Guard) {
        self.guards.push(guard);
    }

    pub fn extend(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// JSON payload understood by the store's batch script, also used as the
    /// recovery artifact format.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&WireBatch {
            guards: self.guards.iter().map(Guard::to_args).collect(),
            commands: self.commands.iter().map(Command::to_args).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_increment_renders_without_fraction() {
        let command = Command::HIncrByFloat {
            key: "ltc:times:current:values".into(),
            field: "Lminer".into(),
            delta: 300.0,
        };
        assert_eq!(
            command.to_args(),
            vec!["HINCRBYFLOAT", "ltc:times:current:values", "Lminer", "300"]
        );
    }

    #[test]
    fn test_absent_field_guard_has_no_value() {
        let guard = Guard::Field {
            key: "ltc:main:stats".into(),
            field: "lastCycle".into(),
            value: None,
        };
        assert_eq!(guard.to_args(), vec!["field", "ltc:main:stats", "lastCycle"]);
    }

    #[test]
    fn test_wire_format() {
        let mut batch = Batch::new();
        batch.guard(Guard::Member {
            key: "pending".into(),
            member: "m".into(),
        });
        batch.push(Command::Del {
            keys: vec!["a".into(), "b".into()],
        });
        let wire: serde_json::Value = serde_json::from_str(&batch.to_wire().unwrap()).unwrap();
        assert_eq!(wire["guards"][0], serde_json::json!(["member", "pending", "m"]));
        assert_eq!(wire["commands"][0], serde_json::json!(["DEL", "a", "b"]));
    }
}
