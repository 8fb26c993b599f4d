use crate::runtime::Supervisor;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{error::ReadlineError, Config, Context, Editor, Helper};
use std::path::Path;

const COMMANDS: [&str; 6] = ["status", "start", "stop", "restart", "logs", "exit"];
const DEFAULT_TAIL: usize = 20;


/*
    @@@
    @CmdCompleter;
    . Drops CmdCompleter into 'rl.set_helper(Some(...))' and get instant, prefix-based command completion.
    . Plugs into rustyline to provide simple tab-completion based on a fixed list of command names.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, _pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(line))
            .map(|cmd| Pair { display: cmd.clone(), replacement: cmd.clone() })
            .collect();
        Ok((0, matches))
    }
}


#[derive(Debug, PartialEq, Eq)]
pub enum ShellCommand {
    Status,
    Start,
    Stop,
    Restart,
    Logs(usize),
    Exit,
    Empty,
    Unknown(String),
}

pub fn parse_command(input: &str) -> ShellCommand {
    let mut words = input.split_whitespace();
    let Some(head) = words.next() else {
        return ShellCommand::Empty;
    };
    match (head, words.next()) {
        ("status", None) => ShellCommand::Status,
        ("start", None) => ShellCommand::Start,
        ("stop", None) => ShellCommand::Stop,
        ("restart", None) => ShellCommand::Restart,
        ("exit" | "quit", None) => ShellCommand::Exit,
        ("logs", None) => ShellCommand::Logs(DEFAULT_TAIL),
        ("logs", Some(n)) => match n.parse() {
            Ok(n) => ShellCommand::Logs(n),
            Err(_) => ShellCommand::Unknown(input.trim().to_string()),
        },
        _ => ShellCommand::Unknown(input.trim().to_string()),
    }
}



/*
    @@@
    @run_shell();
    . Reads commands with rustyline (history under <history_dir>/history.txt, saved after every entry) until `exit`, Ctrl-C or Ctrl-D.
    . status/start/stop/restart/logs drive the supervisor; errors are printed, never fatal.
    . The blocking readline runs inside block_in_place so the runtime keeps serving the supervisor tasks.
*/
pub async fn run_shell(supervisor: Supervisor, history_dir: &Path) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.into_iter().map(String::from).collect(),
    }));
    let history = history_dir.join("history.txt");
    let _ = rl.load_history(&history);
    let _ = std::fs::create_dir_all(history_dir);

    loop {
        let line = tokio::task::block_in_place(|| rl.readline("webvisor> "));
        match line {
            Ok(line) => {
                let input = line.trim();
                if !input.is_empty() {
                    rl.add_history_entry(input)?;
                    // saved per entry: a signal may end the process without returning here
                    let _ = rl.save_history(&history);
                }
                match parse_command(input) {
                    ShellCommand::Status => {
                        println!("{}", supervisor.state());
                        if let Some(reason) = supervisor.last_error() {
                            println!("last error: {reason}");
                        }
                    }
                    ShellCommand::Start => report(supervisor.start().await),
                    ShellCommand::Stop => report(supervisor.stop().await),
                    ShellCommand::Restart => report(supervisor.restart().await),
                    ShellCommand::Logs(n) => {
                        for l in supervisor.output_tail(n) {
                            println!("{} [{}] {}", l.timestamp.format("%H:%M:%S"), l.stream, l.text);
                        }
                    }
                    ShellCommand::Exit => break,
                    ShellCommand::Empty => {}
                    ShellCommand::Unknown(other) => println!("Unknown command: {}", other),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    rl.save_history(&history)?;
    Ok(())
}

fn report(result: Result<(), crate::error::SupervisorError>) {
    if let Err(e) = result {
        println!("error: {e}");
    }
}
