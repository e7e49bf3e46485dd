use std::io::{stdin, stdout, Write};

use anyhow::Result;
use cache_core::{
    cache::{AddressFields, BitWidths},
    exercise::{Grade, Session},
    memory::Addr,
};

#[cfg(feature = "stat")]
use cache_core::stat::AddStats;

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

peg::parser!(grammar command() for str {
    rule number() -> usize
        = n:$(quiet!{['0'..='9']+}) {? n.parse().or(Err("number")) }
        / expected!("number")
    rule addr() -> usize
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9' | 'a'..='f' | 'A'..='F']+})
            {? usize::from_str_radix(n, 16).or(Err("hex address")) }
        / number()
    rule token() = quiet!{[^ ' ' | '\t' | '\r' | '\n']+}
    // Decomposition answers default to binary, the way the worksheets are
    // filled in; 0x/0d prefixes select hex/decimal. Anything else counts as
    // an answer of 0.
    rule field() -> usize
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9' | 'a'..='f' | 'A'..='F']+})
            {? usize::from_str_radix(n, 16).or(Err("hex digits")) }
        / quiet!{"0" ['d' | 'D']} n:$(quiet!{['0'..='9']+})
            {? n.parse().or(Err("decimal digits")) }
        / n:$(quiet!{['0' | '1']+}) !token() {? usize::from_str_radix(n, 2).or(Err("binary digits")) }
        / token() { 0 }
    rule mem() = "memory" / "mem"
    rule show_kind() -> ShowKind
        = mem() __ a:addr() { ShowKind::Memory(a) }
        / "state" { ShowKind::State }
        / "stat" { ShowKind::Stat }
        / ("operation" / "op") { ShowKind::Operation }
    pub(crate) rule parse_command() -> Command
        = _ ("exit" / "quit") _ { Command::Exit }
        / _ "help" _ { Command::Help }
        / _ "reveal" _ { Command::Reveal }
        / _ "reset" _ { Command::Reset }
        / _ "show" __ s:show_kind() _ { Command::Show(s) }
        / _ "goto" __ n:number() _ { Command::Goto(n) }
        / _ ("next" / "n") _ { Command::Next }
        / _ ("previous" / "prev" / "p") _ { Command::Prev }
        / _ ("hit" / "h") _ { Command::HitMiss(true) }
        / _ ("miss" / "m") _ { Command::HitMiss(false) }
        / _ t:field() __ s:field() __ b:field() __ y:field() _ {
            Command::Fields(AddressFields {
                tag: t,
                set_index: s,
                block_offset: b,
                byte_offset: y,
            })
        }
        / expected!("command")

    rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']}
        / expected!("whitespace")
    rule _() = ws()*
    rule __() = ws()+
});

pub(crate) enum Command {
    Fields(AddressFields),
    HitMiss(bool),
    Show(ShowKind),
    Next,
    Prev,
    /// 1-based operation number, as displayed.
    Goto(usize),
    Reveal,
    Reset,
    Help,
    Exit,
}

pub(crate) enum ShowKind {
    Operation,
    State,
    Memory(usize),
    Stat,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fields,
    HitMiss,
}

fn bin(value: usize, bits: usize) -> String {
    if bits == 0 {
        "-".to_owned()
    } else {
        format!("0b{value:0bits$b}")
    }
}

fn field_layout(widths: BitWidths) -> String {
    format!(
        "tag[{}] set[{}] block[{}] byte[{}]",
        widths.tag_bits, widths.index_bits, widths.block_offset_bits, widths.byte_offset_bits
    )
}

pub fn run_drill(session: &mut Session, title: &str) -> Result<()> {
    if session.is_empty() {
        println!("no operations loaded.");
        return Ok(());
    }
    println!("drill: {title}");
    println!(
        "{} operations. For each one, give the address decomposition ({}), then hit or miss.",
        session.len(),
        field_layout(session.cache().widths())
    );
    println!("type `help` for commands.");
    'drill: loop {
        let Some(op) = session.current() else {
            break;
        };
        println!();
        println!(
            "operation {}/{}: {}",
            session.position() + 1,
            session.len(),
            op
        );
        let mut stage = Stage::Fields;
        'question: loop {
            match stage {
                Stage::Fields => print!("[decompose] > "),
                Stage::HitMiss => print!("[hit/miss] > "),
            }
            stdout().flush()?;
            let mut line = String::new();
            if stdin().read_line(&mut line)? == 0 {
                break 'drill;
            }
            let parsed = match command::parse_command(&line) {
                Ok(p) => p,
                Err(e) => {
                    println!("parse error: expected {}", e.expected);
                    continue;
                }
            };
            match parsed {
                Command::Exit => break 'drill,
                Command::Help => print_help(),
                Command::Show(kind) => show(session, kind),
                Command::Next => {
                    session.advance();
                    continue 'drill;
                }
                Command::Prev => {
                    session.retreat();
                    continue 'drill;
                }
                Command::Goto(n) => {
                    session.seek(n.saturating_sub(1));
                    continue 'drill;
                }
                Command::Reset => {
                    session.reset_to_start();
                    println!("back to the start; cache and memory wiped.");
                    continue 'drill;
                }
                Command::Reveal => match stage {
                    Stage::Fields => {
                        reveal_fields(session);
                        stage = Stage::HitMiss;
                    }
                    Stage::HitMiss => {
                        finish_operation(session)?;
                        if next_or_done(session) {
                            continue 'drill;
                        }
                        break 'drill;
                    }
                },
                Command::Fields(answer) => {
                    if stage != Stage::Fields {
                        println!("decomposition already answered; say `hit` or `miss`.");
                        continue 'question;
                    }
                    match session.grade_decomposition(answer) {
                        Grade::NoOperation => continue 'drill,
                        Grade::Graded(fb) => {
                            println!("{}", fb.message);
                            if fb.advance {
                                stage = Stage::HitMiss;
                            }
                        }
                    }
                }
                Command::HitMiss(guess) => {
                    if stage != Stage::HitMiss {
                        println!("decompose the address first (or `reveal`).");
                        continue 'question;
                    }
                    match session.grade_hit_miss(guess)? {
                        Grade::NoOperation => continue 'drill,
                        Grade::Graded(fb) => {
                            println!("{}", fb.message);
                            if fb.advance {
                                finish_operation(session)?;
                                if next_or_done(session) {
                                    continue 'drill;
                                }
                                break 'drill;
                            }
                        }
                    }
                }
            }
        }
    }
    println!();
    println!("session over.");
    show_stat(session);
    Ok(())
}

fn reveal_fields(session: &Session) {
    let Some(truth) = session.correct_decomposition() else {
        return;
    };
    let widths = session.cache().widths();
    println!(
        "decomposition: tag={} set={} block={} byte={}",
        bin(truth.tag, widths.tag_bits),
        bin(truth.set_index, widths.index_bits),
        bin(truth.block_offset, widths.block_offset_bits),
        bin(truth.byte_offset, widths.byte_offset_bits),
    );
}

/// Prints the ground-truth outcome of the current operation. The access has
/// already run (or runs now, once); repeat calls stay memoized.
fn finish_operation(session: &mut Session) -> Result<()> {
    let Some(outcome) = session.execute_current()? else {
        return Ok(());
    };
    let verdict = if outcome.hit { "HIT" } else { "MISS" };
    match outcome.value {
        Some(v) => println!(
            "=> {verdict}, value {v}  [set {}, way {}]",
            outcome.placement.set_index, outcome.placement.way
        ),
        None => println!(
            "=> {verdict}  [set {}, way {}]",
            outcome.placement.set_index, outcome.placement.way
        ),
    }
    Ok(())
}

/// Moves to the next operation; false when the drill just finished.
fn next_or_done(session: &mut Session) -> bool {
    if session.position() + 1 < session.len() {
        session.advance();
        true
    } else {
        false
    }
}

fn show(session: &Session, kind: ShowKind) {
    match kind {
        ShowKind::Operation => match session.current() {
            Some(op) => println!(
                "operation {}/{}: {} (attempts: {})",
                session.position() + 1,
                session.len(),
                op,
                session.attempts_for_current()
            ),
            None => println!("no current operation."),
        },
        ShowKind::Memory(a) => {
            let addr = Addr::new(a);
            match session.cache().memory().read(addr) {
                Ok(v) => println!("M[{addr}] == {v}"),
                Err(e) => println!("{e}"),
            }
        }
        ShowKind::State => {
            let widths = session.cache().widths();
            let mut any = false;
            for (set_index, set) in session.cache().snapshot().iter().enumerate() {
                for (way, line) in set.iter().enumerate() {
                    if !line.valid {
                        continue;
                    }
                    any = true;
                    println!(
                        "set {set_index:>4} way {way}: tag={} data={:?}{} recency={}",
                        bin(line.tag, widths.tag_bits),
                        line.data,
                        if line.dirty { " dirty" } else { "" },
                        line.recency
                    );
                }
            }
            if !any {
                println!("cache is empty.");
            }
        }
        ShowKind::Stat => show_stat(session),
    }
}

#[cfg(feature = "stat")]
fn show_stat(session: &Session) {
    let max_width = get_terminal_width().unwrap_or(60) as usize;
    let mut stats = Default::default();
    session.add_stats(&mut stats);
    println!("{}", stats.view(max_width));
}

#[cfg(not(feature = "stat"))]
fn show_stat(session: &Session) {
    let s = session.cache().statistics();
    println!(
        "hits: {}, misses: {}, hit rate: {:.1} %",
        s.hits, s.misses, s.hit_rate_percent
    );
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0 - 20)
}

fn print_help() {
    println!("answers:");
    println!("  <tag> <set> <block> <byte>   decomposition, binary by default (0x…/0d… override)");
    println!("  hit | miss                   hit/miss prediction");
    println!("commands:");
    println!("  show op | show state | show mem <addr> | show stat");
    println!("  next | prev | goto <n>       move between operations");
    println!("  reveal                       give up on the current question");
    println!("  reset                        restart the drill from operation 1");
    println!("  exit                         leave the drill");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(cmd: Command) -> AddressFields {
        match cmd {
            Command::Fields(f) => f,
            _ => panic!("expected a decomposition answer"),
        }
    }

    #[test]
    fn binary_fields_parse() {
        let f = fields(command::parse_command("1011 11010010 10 00").unwrap());
        assert_eq!(
            f,
            AddressFields {
                tag: 0b1011,
                set_index: 0b1101_0010,
                block_offset: 0b10,
                byte_offset: 0,
            }
        );
    }

    #[test]
    fn prefixed_radixes_parse() {
        let f = fields(command::parse_command("0xb 0d210 10 0").unwrap());
        assert_eq!(f.tag, 0xb);
        assert_eq!(f.set_index, 210);
        assert_eq!(f.block_offset, 2);
    }

    #[test]
    fn malformed_field_counts_as_zero() {
        let f = fields(command::parse_command("banana 11 0 0").unwrap());
        assert_eq!(f.tag, 0);
        assert_eq!(f.set_index, 3);
        // Decimal digits without the 0d prefix are not binary.
        let f = fields(command::parse_command("42 0 0 0").unwrap());
        assert_eq!(f.tag, 0);
    }

    #[test]
    fn keywords_win_over_fields() {
        assert!(matches!(
            command::parse_command("hit"),
            Ok(Command::HitMiss(true))
        ));
        assert!(matches!(
            command::parse_command("miss"),
            Ok(Command::HitMiss(false))
        ));
        assert!(matches!(
            command::parse_command(" show mem 0x1000 "),
            Ok(Command::Show(ShowKind::Memory(0x1000)))
        ));
        assert!(matches!(
            command::parse_command("goto 3"),
            Ok(Command::Goto(3))
        ));
        assert!(command::parse_command("gibberish").is_err());
    }
}
