//! Human/JSON dual-mode rendering, mirroring the teacher's
//! `cli::output::CommandOutput` split.

use serde::Serialize;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
}

pub fn print<T: CommandOutput>(value: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        println!("{}", value.to_human());
    }
}
