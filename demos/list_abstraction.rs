//! Builds a singly-linked list, summarizes it, and joins it with a shorter one.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example list_abstraction -- 10 --short 3 --output smg.dot
//! dot -Tpng smg.dot -o smg.png
//! ```

use clap::Parser;

use smg_rs::machine::MachineModel;
use smg_rs::options::SmgOptions;
use smg_rs::state::SmgState;
use smg_rs::types::Value;
use smg_rs::verifier::CheckLevel;

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Number of list nodes.
    #[arg(value_name = "INT", default_value = "5")]
    length: usize,

    /// Length of the list joined with the first one.
    #[clap(long, value_name = "INT", default_value = "2")]
    short: usize,

    /// Write the DOT export of the joined state to this file instead of stdout.
    #[clap(long, value_name = "FILE")]
    output: Option<std::path::PathBuf>,
}

/// `head = n0 -> n1 -> ... -> NULL`, each node a zeroed data word and a link.
fn build_list(options: SmgOptions, length: usize) -> color_eyre::Result<SmgState> {
    let state = SmgState::new(MachineModel::LINUX64, options);
    let (mut state, head) = state.add_global_variable(8, "head")?;
    let mut next = Value::NULL;
    for _ in 0..length {
        let (s, node) = state.alloc_heap(16, "node")?;
        let (s, object, _) = s.dereference(node)?.remove(0);
        state = s.write(object, 0, 8, Value::NULL)?.write(object, 8, 8, next)?;
        next = node;
    }
    Ok(state.write(head, 0, 8, next)?)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    simplelog::TermLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let args = Cli::parse();
    println!("args = {:?}", args);

    let options = SmgOptions::default().with_check_level(CheckLevel::Full);

    let long = build_list(options, args.length)?;
    let abstracted = long.abstract_lists()?.prune_unreachable()?;
    println!("list of {} nodes covered by its summary: {}", args.length, long.is_less_or_equal(&abstracted));

    let short = build_list(options, args.short)?.abstract_lists()?.prune_unreachable()?;
    let shown = match abstracted.join(&short)? {
        Some((joined, status)) => {
            println!("join status: {}", status);
            joined
        }
        None => {
            println!("lists of {} and {} nodes do not join", args.length, args.short);
            abstracted
        }
    };

    let dot = shown.to_dot()?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, dot)?;
            println!("DOT written to {}", path.display());
        }
        None => println!("{}", dot),
    }

    Ok(())
}
