use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    cache::{AccessOutcome, AddressFields, Cache},
    memory::{self, Addr},
};

/// How many wrong answers a question allows before the correct answer is
/// revealed and the student is moved on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// One step of an exercise: a single memory operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Read { addr: usize },
    Write { addr: usize, value: u32 },
}

impl Operation {
    pub fn addr(&self) -> Addr {
        match self {
            Operation::Read { addr } | Operation::Write { addr, .. } => Addr::new(*addr),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read { addr } => write!(f, "read @ {}", Addr::new(*addr)),
            Operation::Write { addr, value } => {
                write!(f, "write @ {} = {}", Addr::new(*addr), value)
            }
        }
    }
}

/// Outcome of grading one answer.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Grade {
    /// The sequence is empty or exhausted. A normal end state, not an error.
    NoOperation,
    Graded(Feedback),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Feedback {
    pub correct: bool,
    /// Whether the front end may move to the next operation: either the
    /// answer was right, or the attempt limit was hit and the answer has
    /// been revealed in `message`.
    pub advance: bool,
    pub message: String,
}

/// Drives an operation sequence against a cache and grades student answers.
///
/// Each operation's access runs against the cache exactly once; the outcome
/// is memoized per operation index so repeated grading (or a re-visit after
/// navigation) never re-drives the LRU/fill state. The session exclusively
/// owns the cache, which owns the memory.
pub struct Session {
    cache: Cache,
    operations: Vec<Operation>,
    cursor: usize,
    attempts: HashMap<usize, u32>,
    outcomes: HashMap<usize, AccessOutcome>,
    max_attempts: u32,
}

impl Session {
    pub fn new(cache: Cache) -> Self {
        Self::with_max_attempts(cache, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(cache: Cache, max_attempts: u32) -> Self {
        Self {
            cache,
            operations: Vec::new(),
            cursor: 0,
            attempts: HashMap::new(),
            outcomes: HashMap::new(),
            max_attempts,
        }
    }

    /// Replaces the operation sequence and rewinds to the start. With
    /// `reset_underlying`, cache and memory are wiped back to zero too.
    pub fn load(&mut self, operations: Vec<Operation>, reset_underlying: bool) {
        self.operations = operations;
        self.cursor = 0;
        self.attempts.clear();
        self.outcomes.clear();
        if reset_underlying {
            self.cache.reset();
            self.cache.memory_mut().reset();
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// 0-based cursor position.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<Operation> {
        self.operations.get(self.cursor).copied()
    }

    pub fn attempts_for_current(&self) -> u32 {
        self.attempts.get(&self.cursor).copied().unwrap_or(0)
    }

    /// Moves to the next operation; no-op at the end.
    pub fn advance(&mut self) {
        if self.cursor + 1 < self.operations.len() {
            self.cursor += 1;
        }
    }

    /// Moves to the previous operation; no-op at the start.
    pub fn retreat(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// Jumps to an explicit index; ignored when out of range.
    pub fn seek(&mut self, index: usize) {
        if index < self.operations.len() {
            self.cursor = index;
        }
    }

    /// Runs the current operation against the cache, exactly once. Repeat
    /// calls for the same index return the memoized outcome instead of
    /// mutating the cache again. `None` when the sequence is empty.
    pub fn execute_current(&mut self) -> memory::Result<Option<AccessOutcome>> {
        let Some(op) = self.current() else {
            return Ok(None);
        };
        if let Some(outcome) = self.outcomes.get(&self.cursor) {
            return Ok(Some(*outcome));
        }
        let outcome = match op {
            Operation::Read { addr } => self.cache.read(Addr::new(addr))?,
            Operation::Write { addr, value } => self.cache.write(Addr::new(addr), value)?,
        };
        let _ = self.outcomes.insert(self.cursor, outcome);
        Ok(Some(outcome))
    }

    /// The true decomposition for the current operation's address. Pure, so
    /// it may be called any number of times.
    pub fn correct_decomposition(&self) -> Option<AddressFields> {
        self.current().map(|op| self.cache.decompose(op.addr()))
    }

    /// Grades a hit/miss prediction against the memoized ground truth.
    pub fn grade_hit_miss(&mut self, guess: bool) -> memory::Result<Grade> {
        let Some(outcome) = self.execute_current()? else {
            return Ok(Grade::NoOperation);
        };
        let actual = outcome.hit;
        Ok(Grade::Graded(self.score(guess == actual, || {
            format!(
                "Incorrect. The correct answer is {}.",
                if actual { "Hit" } else { "Miss" }
            )
        })))
    }

    /// Grades an address decomposition; all four fields must match.
    pub fn grade_decomposition(&mut self, answer: AddressFields) -> Grade {
        let Some(truth) = self.correct_decomposition() else {
            return Grade::NoOperation;
        };
        if answer == truth {
            return Grade::Graded(self.score(true, String::new));
        }
        let mut wrong = Vec::new();
        if answer.tag != truth.tag {
            wrong.push(format!("tag (correct: {})", truth.tag));
        }
        if answer.set_index != truth.set_index {
            wrong.push(format!("set index (correct: {})", truth.set_index));
        }
        if answer.block_offset != truth.block_offset {
            wrong.push(format!("block offset (correct: {})", truth.block_offset));
        }
        if answer.byte_offset != truth.byte_offset {
            wrong.push(format!("byte offset (correct: {})", truth.byte_offset));
        }
        Grade::Graded(self.score(false, || {
            format!(
                "Incorrect. Correct answer: tag={}, set index={}, block offset={}, byte offset={}",
                truth.tag, truth.set_index, truth.block_offset, truth.byte_offset
            )
        }))
        .also_name_fields(wrong)
    }

    fn score<F: FnOnce() -> String>(&mut self, correct: bool, reveal: F) -> Feedback {
        if correct {
            let _ = self.attempts.insert(self.cursor, 0);
            return Feedback {
                correct: true,
                advance: true,
                message: "Correct!".to_owned(),
            };
        }
        let attempts = self.attempts_for_current() + 1;
        let _ = self.attempts.insert(self.cursor, attempts);
        if attempts >= self.max_attempts {
            Feedback {
                correct: false,
                advance: true,
                message: reveal(),
            }
        } else {
            Feedback {
                correct: false,
                advance: false,
                message: "Incorrect, try again.".to_owned(),
            }
        }
    }

    /// Cursor to 0, attempt counts and memoized outcomes cleared, cache and
    /// memory back to zero.
    pub fn reset_to_start(&mut self) {
        self.cursor = 0;
        self.attempts.clear();
        self.outcomes.clear();
        self.cache.reset();
        self.cache.memory_mut().reset();
    }
}

impl Grade {
    /// Appends per-field hints to a try-again message.
    fn also_name_fields(self, wrong: Vec<String>) -> Self {
        match self {
            Grade::Graded(mut fb) if !fb.correct && !fb.advance && !wrong.is_empty() => {
                fb.message = format!("Incorrect: {}. Try again.", wrong.join(", "));
                Grade::Graded(fb)
            }
            other => other,
        }
    }
}

#[cfg(feature = "stat")]
impl crate::stat::AddStats for Session {
    fn add_stats(&self, buf: &mut crate::stat::Stats) {
        buf.push(Box::new(stat::ProgressStat {
            position: self.cursor,
            total: self.operations.len(),
            executed: self.outcomes.len(),
        }));
        crate::stat::AddStats::add_stats(&self.cache, buf);
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::{Stat, StatView};

    pub struct ProgressStat {
        pub position: usize,
        pub total: usize,
        pub executed: usize,
    }

    impl Stat for ProgressStat {
        fn view(&self) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ ProgressStat {
        fn header(&self) -> &'static str {
            "exercise progress"
        }
        fn width(&self) -> usize {
            30
        }
    }

    impl fmt::Display for &'_ ProgressStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let at = if self.total == 0 {
                "-".to_owned()
            } else {
                format!("{}/{}", self.position + 1, self.total)
            };
            writeln!(f, "  {:>9}: {at:>9}", "operation")?;
            writeln!(f, "  {:>9}: {:>9}", "executed", self.executed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, WritePolicy};
    use crate::memory::Memory;

    fn session_with(ops: Vec<Operation>) -> Session {
        let config = CacheConfig::direct_mapped(256, 4, WritePolicy::WriteThrough);
        let cache = Cache::new(config, Memory::new()).unwrap();
        let mut s = Session::new(cache);
        s.load(ops, false);
        s
    }

    fn feedback(grade: Grade) -> Feedback {
        match grade {
            Grade::Graded(fb) => fb,
            Grade::NoOperation => panic!("expected a graded answer"),
        }
    }

    #[test]
    fn empty_session_is_benign_everywhere() {
        let mut s = session_with(vec![]);
        assert_eq!(s.current(), None);
        assert_eq!(s.execute_current().unwrap(), None);
        assert_eq!(s.grade_hit_miss(true).unwrap(), Grade::NoOperation);
        let zeros = AddressFields {
            tag: 0,
            set_index: 0,
            block_offset: 0,
            byte_offset: 0,
        };
        assert_eq!(s.grade_decomposition(zeros), Grade::NoOperation);
        s.advance();
        s.retreat();
        s.seek(3);
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn navigation_clamps_at_both_ends() {
        let mut s = session_with(vec![
            Operation::Read { addr: 0x1000 },
            Operation::Read { addr: 0x1004 },
        ]);
        s.retreat();
        assert_eq!(s.position(), 0);
        s.advance();
        s.advance();
        s.advance();
        assert_eq!(s.position(), 1);
        s.seek(5);
        assert_eq!(s.position(), 1);
        s.seek(0);
        assert_eq!(s.position(), 0);
    }

    #[test]
    fn execute_current_runs_the_access_exactly_once() {
        let mut s = session_with(vec![Operation::Read { addr: 0x1000 }]);
        let first = s.execute_current().unwrap().unwrap();
        assert!(!first.hit);
        // A second call must not re-run the access (which would now hit).
        let again = s.execute_current().unwrap().unwrap();
        assert_eq!(again, first);
        assert_eq!(s.cache().statistics().total, 1);
    }

    #[test]
    fn correct_guess_advances_and_resets_attempts() {
        let mut s = session_with(vec![Operation::Read { addr: 0x1000 }]);
        // Burn one attempt first.
        let fb = feedback(s.grade_hit_miss(true).unwrap());
        assert!(!fb.correct);
        assert!(!fb.advance);
        assert_eq!(s.attempts_for_current(), 1);
        let fb = feedback(s.grade_hit_miss(false).unwrap());
        assert!(fb.correct);
        assert!(fb.advance);
        assert_eq!(s.attempts_for_current(), 0);
    }

    #[test]
    fn two_wrong_guesses_reveal_and_advance() {
        let mut s = session_with(vec![Operation::Read { addr: 0x1000 }]);
        let fb = feedback(s.grade_hit_miss(true).unwrap());
        assert_eq!(fb.message, "Incorrect, try again.");
        let fb = feedback(s.grade_hit_miss(true).unwrap());
        assert!(!fb.correct);
        assert!(fb.advance);
        assert_eq!(fb.message, "Incorrect. The correct answer is Miss.");
    }

    #[test]
    fn grading_does_not_change_the_outcome() {
        // Two wrong hit/miss answers on the same operation must grade
        // against the same ground truth both times.
        let mut s = session_with(vec![Operation::Read { addr: 0x1000 }]);
        let fb = feedback(s.grade_hit_miss(true).unwrap());
        assert!(!fb.correct);
        let fb = feedback(s.grade_hit_miss(true).unwrap());
        assert!(!fb.correct, "second grading saw a hit: access was re-run");
    }

    #[test]
    fn decomposition_grading_names_wrong_fields() {
        let mut s = session_with(vec![Operation::Read { addr: 0xBD28 }]);
        let truth = s.correct_decomposition().unwrap();
        let mut answer = truth;
        answer.tag += 1;
        answer.block_offset ^= 1;
        let fb = feedback(s.grade_decomposition(answer));
        assert!(!fb.correct);
        assert!(!fb.advance);
        assert!(fb.message.contains("tag (correct:"));
        assert!(fb.message.contains("block offset (correct:"));
        assert!(!fb.message.contains("set index"));
        // Second failure reveals the full answer.
        let fb = feedback(s.grade_decomposition(answer));
        assert!(fb.advance);
        assert!(fb.message.contains("Correct answer:"));
        // All-correct passes.
        let fb = feedback(s.grade_decomposition(truth));
        assert!(fb.correct);
    }

    #[test]
    fn attempts_are_tracked_per_operation() {
        let mut s = session_with(vec![
            Operation::Read { addr: 0x1000 },
            Operation::Read { addr: 0x1004 },
        ]);
        let _ = s.grade_hit_miss(true).unwrap();
        assert_eq!(s.attempts_for_current(), 1);
        s.advance();
        assert_eq!(s.attempts_for_current(), 0);
    }

    #[test]
    fn writes_grade_like_reads() {
        let mut s = session_with(vec![Operation::Write { addr: 0x3000, value: 7 }]);
        let outcome = s.execute_current().unwrap().unwrap();
        assert!(!outcome.hit);
        assert_eq!(outcome.value, None);
        let fb = feedback(s.grade_hit_miss(false).unwrap());
        assert!(fb.correct);
    }

    #[test]
    fn reset_to_start_wipes_everything() {
        let mut s = session_with(vec![
            Operation::Read { addr: 0x1000 },
            Operation::Read { addr: 0x1000 },
        ]);
        let _ = s.execute_current().unwrap();
        s.advance();
        let second = s.execute_current().unwrap().unwrap();
        assert!(second.hit);
        s.reset_to_start();
        assert_eq!(s.position(), 0);
        assert_eq!(s.attempts_for_current(), 0);
        assert_eq!(s.cache().statistics().total, 0);
        // Outcome memos are gone; the first access misses afresh.
        assert!(!s.execute_current().unwrap().unwrap().hit);
    }
}
