//! Predefined drills, ported from the worksheet exercises, plus loading of
//! user-written exercise files (the command-line counterpart of entering
//! operations by hand).

use std::io;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cache::{CacheConfig, ParseWritePolicyError, WritePolicy},
    exercise::Operation,
    memory::{self, Memory},
};

#[derive(Error, Debug)]
pub enum ExerciseError {
    #[error("unknown exercise `{0}`")]
    UnknownExercise(String),
    #[error(transparent)]
    Memory(#[from] memory::MemoryAccessError),
    #[error("failed to read exercise file")]
    Io(#[from] io::Error),
    #[error("malformed exercise file")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Policy(#[from] ParseWritePolicyError),
}

pub type Result<T> = std::result::Result<T, ExerciseError>;

/// A drill ready to run: the memory it expects has already been
/// pre-populated by [`load`] / [`from_reader`].
#[derive(Debug)]
pub struct LoadedExercise {
    pub title: String,
    /// The cache geometry the drill was written for. A front end may
    /// override it.
    pub config: CacheConfig,
    pub operations: Vec<Operation>,
}

struct ExerciseDef {
    name: &'static str,
    title: &'static str,
    config: CacheConfig,
    build: fn(&mut Memory) -> memory::Result<Vec<Operation>>,
}

static REGISTRY: Lazy<Vec<ExerciseDef>> = Lazy::new(|| {
    vec![
        ExerciseDef {
            name: "part2-direct-mapped",
            title: "Part 2 - Direct-Mapped (4-word blocks)",
            config: CacheConfig::direct_mapped(256, 4, WritePolicy::WriteThrough),
            build: part2_direct_mapped,
        },
        ExerciseDef {
            name: "part3-two-way-lru",
            title: "Part 3 - 2-Way Set-Associative (LRU)",
            config: CacheConfig {
                num_sets: 64,
                block_size_words: 4,
                associativity: 2,
                write_policy: WritePolicy::WriteThrough,
            },
            build: part3_two_way_lru,
        },
        ExerciseDef {
            name: "simple-direct-mapped",
            title: "Simple Direct-Mapped",
            // 1024 sets keep 0x1000 and 0x2000 in different sets, so the
            // final re-read of 0x1000 hits as the worksheet intends.
            config: CacheConfig::direct_mapped(1024, 4, WritePolicy::WriteThrough),
            build: simple_direct_mapped,
        },
        ExerciseDef {
            name: "write-operations",
            title: "Write Operations",
            // 1024 sets for the same reason: 0x4000 must not collide with
            // the dirty 0x3000 block before it is read back.
            config: CacheConfig::direct_mapped(1024, 4, WritePolicy::WriteBack),
            build: write_operations,
        },
    ]
});

/// Names of the predefined drills, in registry order.
pub fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|def| def.name).collect()
}

/// Loads a predefined drill by name, pre-populating `memory` with the values
/// the drill expects. Unknown names leave the memory untouched.
pub fn load(name: &str, memory: &mut Memory) -> Result<LoadedExercise> {
    let def = REGISTRY
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| ExerciseError::UnknownExercise(name.to_owned()))?;
    let operations = (def.build)(memory)?;
    log::info!(
        "loaded exercise `{}` ({} operations)",
        def.name,
        operations.len()
    );
    Ok(LoadedExercise {
        title: def.title.to_owned(),
        config: def.config,
        operations,
    })
}

fn part2_direct_mapped(memory: &mut Memory) -> memory::Result<Vec<Operation>> {
    memory.load_words([
        (0x26C0, 22),
        (0x26C4, 33),
        (0x26C8, 44),
        (0x26CC, 55),
        (0x3520, 66),
        (0x3524, 77),
        (0x3528, 88),
        (0x352C, 99),
    ])?;
    Ok(vec![
        Operation::Read { addr: 0xBD28 },
        Operation::Read { addr: 0xBD24 },
        Operation::Read { addr: 0x8128 },
    ])
}

fn part3_two_way_lru(memory: &mut Memory) -> memory::Result<Vec<Operation>> {
    memory.load_words([
        (0x3238, 123),
        (0x3748, 234),
        (0x9238, 345),
        (0x92A8, 456),
        (0xF038, 567),
        (0xF0A8, 678),
    ])?;
    Ok(vec![
        Operation::Read { addr: 0x3738 },
        Operation::Read { addr: 0xF0A8 },
        Operation::Read { addr: 0x92A8 },
    ])
}

fn simple_direct_mapped(memory: &mut Memory) -> memory::Result<Vec<Operation>> {
    memory.load_words([
        (0x1000, 100),
        (0x1004, 200),
        (0x1008, 300),
        (0x100C, 400),
        (0x2000, 500),
        (0x2004, 600),
    ])?;
    Ok(vec![
        Operation::Read { addr: 0x1000 },
        Operation::Read { addr: 0x1004 },
        Operation::Read { addr: 0x2000 },
        Operation::Read { addr: 0x1000 },
    ])
}

fn write_operations(memory: &mut Memory) -> memory::Result<Vec<Operation>> {
    memory.load_words([(0x3000, 1000), (0x3004, 2000), (0x4000, 3000)])?;
    Ok(vec![
        Operation::Read { addr: 0x3000 },
        Operation::Write {
            addr: 0x3004,
            value: 2500,
        },
        Operation::Read { addr: 0x4000 },
        Operation::Read { addr: 0x3004 },
    ])
}

/// On-disk exercise format, deserialized from JSON.
#[derive(Serialize, Deserialize, Debug)]
pub struct ExerciseFile {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub config: Option<ConfigSpec>,
    /// Words to pre-populate before the first operation.
    #[serde(default)]
    pub memory: Vec<WordInit>,
    pub operations: Vec<Operation>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct WordInit {
    pub addr: usize,
    pub value: u32,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ConfigSpec {
    pub sets: usize,
    pub block_words: usize,
    #[serde(default = "one")]
    pub ways: usize,
    /// `write-through` or `write-back`.
    pub policy: String,
}

fn one() -> usize {
    1
}

impl ConfigSpec {
    pub fn to_config(&self) -> Result<CacheConfig> {
        Ok(CacheConfig {
            num_sets: self.sets,
            block_size_words: self.block_words,
            associativity: self.ways,
            write_policy: self.policy.parse()?,
        })
    }
}

/// Reads an exercise file and pre-populates `memory`, like [`load`] does for
/// predefined drills. The default geometry when the file names none matches
/// the simple worksheet setup.
pub fn from_reader<R: io::Read>(reader: R, memory: &mut Memory) -> Result<LoadedExercise> {
    let file: ExerciseFile = serde_json::from_reader(reader)?;
    let config = match &file.config {
        Some(spec) => spec.to_config()?,
        None => CacheConfig::direct_mapped(256, 4, WritePolicy::WriteThrough),
    };
    memory.load_words(file.memory.iter().map(|w| (w.addr, w.value)))?;
    Ok(LoadedExercise {
        title: file.title.unwrap_or_else(|| "custom exercise".to_owned()),
        config,
        operations: file.operations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::exercise::Session;
    use crate::memory::Addr;

    #[test]
    fn registry_lists_all_drills() {
        assert_eq!(
            names(),
            vec![
                "part2-direct-mapped",
                "part3-two-way-lru",
                "simple-direct-mapped",
                "write-operations",
            ]
        );
    }

    #[test]
    fn unknown_name_changes_nothing() {
        let mut memory = Memory::new();
        let err = load("no-such-drill", &mut memory).unwrap_err();
        assert!(matches!(err, ExerciseError::UnknownExercise(_)));
        assert!(memory.written_addresses().is_empty());
    }

    #[test]
    fn loading_prepopulates_memory() {
        let mut memory = Memory::new();
        let ex = load("simple-direct-mapped", &mut memory).unwrap();
        assert_eq!(ex.operations.len(), 4);
        assert_eq!(memory.read(Addr::new(0x1000)).unwrap(), 100);
        assert_eq!(memory.read(Addr::new(0x2004)).unwrap(), 600);
    }

    #[test]
    fn simple_drill_plays_out_as_the_worksheet_says() {
        let mut memory = Memory::new();
        let ex = load("simple-direct-mapped", &mut memory).unwrap();
        let cache = Cache::new(ex.config, memory).unwrap();
        let mut session = Session::new(cache);
        session.load(ex.operations, false);

        let expect = [
            (false, Some(100)),
            (true, Some(200)),
            (false, Some(500)),
            (true, Some(100)),
        ];
        for (hit, value) in expect {
            let outcome = session.execute_current().unwrap().unwrap();
            assert_eq!(outcome.hit, hit);
            assert_eq!(outcome.value, value);
            session.advance();
        }
    }

    #[test]
    fn write_drill_reads_back_the_written_value() {
        let mut memory = Memory::new();
        let ex = load("write-operations", &mut memory).unwrap();
        let cache = Cache::new(ex.config, memory).unwrap();
        let mut session = Session::new(cache);
        session.load(ex.operations, false);

        assert!(!session.execute_current().unwrap().unwrap().hit);
        session.advance();
        // Write 2500 into the resident block.
        let outcome = session.execute_current().unwrap().unwrap();
        assert!(outcome.hit);
        session.advance();
        assert!(!session.execute_current().unwrap().unwrap().hit);
        session.advance();
        let outcome = session.execute_current().unwrap().unwrap();
        assert!(outcome.hit);
        assert_eq!(outcome.value, Some(2500));
    }

    #[test]
    fn exercise_file_round_trips_through_json() {
        let text = r#"{
            "title": "two reads",
            "config": { "sets": 16, "block_words": 2, "policy": "write-back" },
            "memory": [ { "addr": 64, "value": 7 } ],
            "operations": [
                { "op": "read", "addr": 64 },
                { "op": "write", "addr": 68, "value": 9 }
            ]
        }"#;
        let mut memory = Memory::new();
        let ex = from_reader(text.as_bytes(), &mut memory).unwrap();
        assert_eq!(ex.title, "two reads");
        assert_eq!(ex.config.num_sets, 16);
        assert_eq!(ex.config.write_policy, WritePolicy::WriteBack);
        assert_eq!(memory.read(Addr::new(64)).unwrap(), 7);
        assert_eq!(
            ex.operations,
            vec![
                Operation::Read { addr: 64 },
                Operation::Write { addr: 68, value: 9 }
            ]
        );
    }

    #[test]
    fn bad_policy_string_is_rejected() {
        let text = r#"{
            "config": { "sets": 16, "block_words": 2, "policy": "write-around" },
            "operations": []
        }"#;
        let mut memory = Memory::new();
        assert!(matches!(
            from_reader(text.as_bytes(), &mut memory),
            Err(ExerciseError::Policy(_))
        ));
    }
}
