//! Command line access to device tree described state instances.
//!
//! The tool loads the kernel's device tree, assembles the named state
//! instances, executes the requested dump/get/set operations in command
//! line order, and writes back every instance that was modified. A global
//! advisory lock serialises concurrent invocations.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::process::ExitCode;

use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use log::{debug, warn};
use nix::fcntl::{Flock, FlockArg};
use snafu::{whatever, OptionExt, ResultExt, Whatever};

use statetool_core::backend::Backend;
use statetool_core::device_tree::{sysfs, NodeId, Tree};
use statetool_core::devpath::SysfsProvider;
use statetool_core::digest::DirKeystore;
use statetool_core::state::State;

mod logging;

/// Serialises every tool invocation system-wide.
const LOCK_PATH: &str = "/var/lock/barebox-state";

#[derive(Parser, Debug)]
#[command(name = "statetool", about = "Read and write device state variables")]
struct Cli {
    /// Print the value of a variable
    #[arg(short = 'g', long = "get", value_name = "VARIABLE")]
    get: Vec<String>,

    /// Set a variable: <variable>=<value>
    #[arg(short = 's', long = "set", value_name = "VARIABLE=VALUE")]
    set: Vec<String>,

    /// Specify the state to use (repeatable, default "state")
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: Vec<String>,

    /// Dump the state as KEY=VALUE lines
    #[arg(short = 'd', long = "dump")]
    dump: bool,

    /// Dump the state suitable for shell sourcing
    #[arg(long = "dump-shell")]
    dump_shell: bool,

    /// Increase verbosity
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    quiet: u8,

    /// Load the state without verifying the HMAC
    #[arg(short = 'f')]
    no_authentication: bool,
}

enum Op {
    Get(String),
    Set(String),
}

fn main() -> ExitCode {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };
    logging::init(cli.verbose, cli.quiet);

    match run(&cli, &matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("statetool: {}", error_line(&err));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, matches: &clap::ArgMatches) -> Result<(), Whatever> {
    let _lock = acquire_lock()?;

    let tree = sysfs::load_system_tree().whatever_context("cannot read devicetree")?;

    let names: Vec<String> = if cli.name.is_empty() {
        vec!["state".into()]
    } else {
        cli.name.clone()
    };

    let provider = SysfsProvider::new();
    let keystore = DirKeystore::default();

    let mut states = Vec::new();
    for name in &names {
        let node = find_state_node(&tree, name)
            .with_whatever_context(|| format!("no such node: {name}"))?;
        if log::log_enabled!(log::Level::Debug) {
            debug!("found state node {}:\n{}", tree.path(node), tree.render(node));
        }

        let state_name = match tree.name(node) {
            "" => name.as_str(),
            node_name => node_name,
        };
        let mut state = State::from_node(&tree, node, state_name)
            .with_whatever_context(|_| format!("unable to initialize state {name}"))?;
        let backend = Backend::from_schema(&tree, node, &state, &provider, &keystore)
            .with_whatever_context(|_| format!("cannot initialize backend of {name}"))?;
        state.set_backend(backend);

        if let Err(err) = state.load(!cli.no_authentication) {
            warn!(
                "{}: load failed, continuing with defaults: {}",
                state.name(),
                error_line(&err)
            );
        }
        states.push(state);
    }

    if cli.dump {
        dump(&states, cli.verbose > 0).whatever_context("dump failed")?;
    }
    if cli.dump_shell {
        dump_shell(&states).whatever_context("dump failed")?;
    }

    for op in ops_in_cli_order(cli, matches) {
        match op {
            Op::Get(arg) => {
                let (state, var) = split_ref(&states, &arg);
                let value = states[state]
                    .get(var)
                    .with_whatever_context(|_| format!("cannot read {arg}"))?;
                println!("{value}");
            }
            Op::Set(arg) => {
                let (var, value) = match arg.split_once('=') {
                    Some(split) => split,
                    None => whatever!("usage: --set <variable>=<value>"),
                };
                let (state, var) = split_ref(&states, var);
                states[state]
                    .set(var, value)
                    .with_whatever_context(|_| format!("failed to set variable {var} to {value}"))?;
            }
        }
    }

    for state in &mut states {
        state
            .save()
            .with_whatever_context(|_| format!("failed to save state {}", state.name()))?;
    }

    Ok(())
}

/// The get/set operations, ordered as they appeared on the command line.
fn ops_in_cli_order(cli: &Cli, matches: &clap::ArgMatches) -> Vec<Op> {
    let mut ops: Vec<(usize, Op)> = Vec::new();
    if let Some(indices) = matches.indices_of("get") {
        ops.extend(
            indices.zip(cli.get.iter().cloned().map(Op::Get)),
        );
    }
    if let Some(indices) = matches.indices_of("set") {
        ops.extend(
            indices.zip(cli.set.iter().cloned().map(Op::Set)),
        );
    }
    ops.sort_by_key(|(index, _)| *index);
    ops.into_iter().map(|(_, op)| op).collect()
}

/// Resolve a state reference: try the given name as path or alias, then as
/// a top-level node.
fn find_state_node(tree: &Tree, name: &str) -> Option<NodeId> {
    tree.find_by_path_or_alias(name).or_else(|| {
        if name.starts_with('/') {
            None
        } else {
            tree.find_by_path(&format!("/{name}"))
        }
    })
}

/// Split an optional `<statename>.` qualifier off a variable reference.
/// Only meaningful with several states open; defaults to the first.
fn split_ref<'a>(states: &[State], arg: &'a str) -> (usize, &'a str) {
    if states.len() > 1 {
        if let Some((prefix, rest)) = arg.split_once('.') {
            if let Some(index) = states.iter().position(|s| s.name() == prefix) {
                return (index, rest);
            }
        }
    }
    (0, arg)
}

fn dump(states: &[State], detail: bool) -> Result<(), statetool_core::state::Error> {
    for state in states {
        for var in state.variables() {
            let value = var.get()?;
            if states.len() > 1 {
                print!("{}.{}={value}", state.name(), var.name);
            } else {
                print!("{}={value}", var.name);
            }
            if detail {
                print!(", type={}", var.type_name());
                if let Some(info) = var.info() {
                    print!(", {info}");
                }
            }
            println!();
        }
    }
    Ok(())
}

fn dump_shell(states: &[State]) -> Result<(), statetool_core::state::Error> {
    for state in states {
        for var in state.variables() {
            let value = var.get()?;
            let shell_name = var.name.replace('.', "_");
            println!("{}_{shell_name}=\"{value}\"", state.name());
        }
    }
    Ok(())
}

fn acquire_lock() -> Result<Flock<File>, Whatever> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(LOCK_PATH)
        .with_whatever_context(|_| format!("cannot open lock file {LOCK_PATH}"))?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| errno)
        .with_whatever_context(|_| format!("cannot lock {LOCK_PATH}"))
}

/// One line naming the failure and its cause chain.
fn error_line(err: &dyn std::error::Error) -> String {
    let mut line = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        line.push_str(": ");
        line.push_str(&cause.to_string());
        source = cause.source();
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Cli, clap::ArgMatches) {
        let matches = Cli::command()
            .try_get_matches_from(args)
            .expect("parse args");
        let cli = Cli::from_arg_matches(&matches).expect("from matches");
        (cli, matches)
    }

    #[test]
    fn get_and_set_keep_command_line_order() {
        let (cli, matches) = parse(&[
            "statetool",
            "--set",
            "a=1",
            "--get",
            "b",
            "--set",
            "c=2",
            "--get",
            "a",
        ]);
        let ops = ops_in_cli_order(&cli, &matches);
        let rendered: Vec<String> = ops
            .iter()
            .map(|op| match op {
                Op::Get(arg) => format!("get {arg}"),
                Op::Set(arg) => format!("set {arg}"),
            })
            .collect();
        assert_eq!(rendered, ["set a=1", "get b", "set c=2", "get a"]);
    }

    #[test]
    fn short_options_parse_like_long_ones() {
        let (cli, _) = parse(&["statetool", "-n", "foo", "-n", "bar", "-d", "-vv", "-f"]);
        assert_eq!(cli.name, ["foo", "bar"]);
        assert!(cli.dump);
        assert_eq!(cli.verbose, 2);
        assert!(cli.no_authentication);
    }

    #[test]
    fn state_qualifier_only_applies_with_multiple_states() {
        let mut tree = Tree::new();
        let foo = tree.add_node(tree.root(), "foo");
        tree.write_u32(foo, "magic", 1);
        let bar = tree.add_node(tree.root(), "bar");
        tree.write_u32(bar, "magic", 2);
        let foo = State::from_node(&tree, foo, "foo").unwrap();
        let bar = State::from_node(&tree, bar, "bar").unwrap();

        let single = vec![foo];
        assert_eq!(split_ref(&single, "bar.counter"), (0, "bar.counter"));

        let mut multi = single;
        multi.push(bar);
        assert_eq!(split_ref(&multi, "bar.counter"), (1, "counter"));
        assert_eq!(split_ref(&multi, "counter"), (0, "counter"));
        assert_eq!(split_ref(&multi, "baz.counter"), (0, "baz.counter"));
    }
}
