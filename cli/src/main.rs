mod interactive;

use std::{fs::File, path::PathBuf};

use anyhow::{bail, Context, Result};
use cache_core::{
    cache::{Cache, CacheConfig, WritePolicy},
    exercise::Session,
    exercises,
    memory::Memory,
};
use clap::{Args, Parser, Subcommand};

#[cfg(feature = "stat")]
use cache_core::stat::AddStats;

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// list the predefined exercises
    List,
    /// run an exercise start to finish, printing every outcome
    Run(ExerciseArgs),
    /// practice an exercise interactively
    Drill(ExerciseArgs),
}

#[derive(Args, Debug)]
struct ExerciseArgs {
    /// Name of a predefined exercise (see `list`)
    exercise: Option<String>,
    /// File path to a JSON exercise file instead of a predefined name
    #[arg(short, long)]
    file: Option<PathBuf>,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    #[command(flatten)]
    geometry: GeometryArgs,
}

#[derive(Args, Debug)]
struct GeometryArgs {
    /// Override the number of sets
    #[arg(long)]
    sets: Option<usize>,
    /// Override the words per block
    #[arg(long)]
    block_words: Option<usize>,
    /// Override the ways per set (1 = direct-mapped)
    #[arg(long)]
    ways: Option<usize>,
    /// Override the write policy (write-through or write-back)
    #[arg(long)]
    policy: Option<WritePolicy>,
}

impl GeometryArgs {
    fn apply(&self, base: CacheConfig) -> CacheConfig {
        CacheConfig {
            num_sets: self.sets.unwrap_or(base.num_sets),
            block_size_words: self.block_words.unwrap_or(base.block_size_words),
            associativity: self.ways.unwrap_or(base.associativity),
            write_policy: self.policy.unwrap_or(base.write_policy),
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::List => {
            for name in exercises::names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Run(args) => {
            init_logger(args.verbose);
            let (title, mut session) = build_session(&args)?;
            run_to_end(title, &mut session)
        }
        Command::Drill(args) => {
            init_logger(args.verbose);
            let (title, mut session) = build_session(&args)?;
            interactive::run_drill(&mut session, &title)
        }
    }
}

fn init_logger(verbose: bool) {
    if verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::init();
    }
}

/// Loads the exercise (pre-populating a fresh memory), builds the cache with
/// the exercise's geometry plus any overrides, and wraps both in a session.
fn build_session(args: &ExerciseArgs) -> Result<(String, Session)> {
    let mut memory = Memory::new();
    let exercise = match (&args.file, &args.exercise) {
        (Some(path), _) => {
            let file =
                File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
            exercises::from_reader(file, &mut memory)?
        }
        (None, Some(name)) => exercises::load(name, &mut memory)?,
        (None, None) => bail!("name an exercise or pass --file (try `cachetutor list`)"),
    };
    let config = args.geometry.apply(exercise.config);
    log::info!(
        "cache: {} sets, {}-word blocks, {} way(s), {}",
        config.num_sets,
        config.block_size_words,
        config.associativity,
        config.write_policy
    );
    let cache = Cache::new(config, memory).context("invalid cache configuration")?;
    let mut session = Session::new(cache);
    // The memory is already pre-populated; a reset here would wipe it.
    session.load(exercise.operations, false);
    Ok((exercise.title, session))
}

fn run_to_end(title: String, session: &mut Session) -> Result<()> {
    println!("{title}");
    loop {
        let Some(op) = session.current() else {
            println!("no operations.");
            return Ok(());
        };
        let outcome = session
            .execute_current()?
            .context("operation disappeared mid-run")?;
        let verdict = if outcome.hit { "HIT " } else { "MISS" };
        let value = match outcome.value {
            Some(v) => format!(" = {v}"),
            None => String::new(),
        };
        println!(
            "#{:<3} {verdict} {op}{value}  [set {}, way {}]",
            session.position() + 1,
            outcome.placement.set_index,
            outcome.placement.way
        );
        if session.position() + 1 == session.len() {
            break;
        }
        session.advance();
    }
    output_stat(session);
    Ok(())
}

#[cfg(feature = "stat")]
fn output_stat(session: &Session) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    let mut stats = Default::default();
    session.add_stats(&mut stats);
    println!("{}", stats.view(max_width));
}

#[cfg(not(feature = "stat"))]
fn output_stat(session: &Session) {
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
