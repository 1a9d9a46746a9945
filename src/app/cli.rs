use std::io::{self, Write};

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal,
};
use log::{error, info};

use crate::app::shell::{retrying_shell_task, shell_task};
use crate::manager::task_manager::TaskManager;
use crate::models::task::{Task, TaskId, TaskType};
use crate::worker::worker::WorkerHandle;

const HELP: &[&str] = &[
    "submit <type> <command...>          run a shell command on workers of <type>",
    "retry <type> <expected> <command...> rerun a command until its output equals <expected>",
    "spawn <type> [count]                start workers for <type>",
    "workers                             list workers",
    "status <id> | result <id>           inspect a task",
    "stop <id>                           ask a task to stop",
    "list                                list all tasks",
    "prune                               forget completed and failed tasks",
    "close <type> | open <type>          close a queue (its workers stop) or reopen it",
    "shutdown                            stop all workers at their next poll",
    "exit                                shut down and quit",
];

/// Interactive console driving a `TaskManager`. Returns once the user exits
/// and every worker has stopped.
pub fn run_cli(manager: TaskManager, mut workers: Vec<WorkerHandle>) -> io::Result<()> {
    println!("Task engine started. Enter a command, 'help' or 'exit' to quit.");
    let mut commands_history: Vec<String> = Vec::new();

    terminal::enable_raw_mode()?;
    let outcome = command_loop(&manager, &mut workers, &mut commands_history);
    terminal::disable_raw_mode()?;

    manager.request_shutdown();
    for worker in workers {
        let name = worker.name().to_string();
        match worker.join() {
            Ok(()) => info!("Worker '{}' stopped.", name),
            Err(e) => error!("Worker '{}' ended with error: {}", name, e),
        }
    }
    outcome
}

fn command_loop(
    manager: &TaskManager,
    workers: &mut Vec<WorkerHandle>,
    commands_history: &mut Vec<String>,
) -> io::Result<()> {
    loop {
        let input = read_line(commands_history)?;
        if !input.trim().is_empty() {
            commands_history.push(input.clone());
        }

        let mut args = input.split_whitespace();
        match args.next() {
            Some("submit") => match (args.next(), rest(args)) {
                (Some(task_type), Some(command)) => submit(manager, shell_task(task_type, command)),
                _ => say("Usage: submit <type> <command...>"),
            },
            Some("retry") => match (args.next(), args.next(), rest(args)) {
                (Some(task_type), Some(expected), Some(command)) => {
                    let policy = manager.config().retry.clone().with_expected(expected);
                    submit(manager, retrying_shell_task(task_type, command, policy));
                }
                _ => say("Usage: retry <type> <expected> <command...>"),
            },
            Some("spawn") => match args.next() {
                Some(task_type) => {
                    let count = args
                        .next()
                        .and_then(|n| n.parse().ok())
                        .unwrap_or(manager.config().workers_per_type);
                    match manager.spawn_workers(task_type, count) {
                        Ok(spawned) => {
                            say(&format!("Started {} worker(s) for '{}'.", spawned.len(), task_type));
                            workers.extend(spawned);
                        }
                        Err(e) => say(&format!("Failed to start workers: {}", e)),
                    }
                }
                None => say("Task type must be specified."),
            },
            Some("workers") => {
                if workers.is_empty() {
                    say("No workers");
                }
                for worker in workers.iter() {
                    let state = if worker.is_active() { "active" } else { "stopped" };
                    say(&format!("{}\t {} \t {}", worker.name(), worker.task_type(), state));
                }
            }
            Some("status") => with_task(manager, args.next(), |task| {
                say(&format!("Task {} status: {:?}", task.id(), task.status()));
            }),
            Some("result") => with_task(manager, args.next(), |task| {
                if let Some(err) = task.exception() {
                    say(&format!("Task {} failed: {:#}", task.id(), err));
                } else if let Some(value) = task.result() {
                    match value.as_array() {
                        Some(lines) => lines
                            .iter()
                            .for_each(|line| say(line.as_str().unwrap_or_default())),
                        None => say(&value.to_string()),
                    }
                } else {
                    say(&format!("Task {} has no result yet ({:?}).", task.id(), task.status()));
                }
            }),
            Some("stop") => match parse_id(args.next()) {
                Some(id) => match manager.stop_task(id) {
                    Ok(()) => say(&format!("Sent stop signal for task {}", id)),
                    Err(e) => say(&e.to_string()),
                },
                None => say("Valid task ID must be specified."),
            },
            Some("list") => {
                let tasks = manager.get_all_tasks();
                if tasks.is_empty() {
                    say("No tasks");
                } else {
                    say(&format!("{:<36}\t {:<10} \t {:<8} \t {}", "ID", "Status", "Type", "Name"));
                    say(&"-".repeat(80));
                    for task in tasks {
                        say(&format!(
                            "{}\t {:<10} \t {:<8} \t {}",
                            task.id(),
                            format!("{:?}", task.status()),
                            task.task_type(),
                            task.name()
                        ));
                    }
                }
            }
            Some("prune") => say(&format!("Pruned {} finished task(s)", manager.prune_finished())),
            Some("close") => match args.next() {
                Some(task_type) => {
                    let dropped = manager.close_type(&TaskType::new(task_type));
                    say(&format!("Closed '{}', {} queued task(s) dropped", task_type, dropped.len()));
                }
                None => say("Usage: close <type>"),
            },
            Some("open") => match args.next() {
                Some(task_type) => {
                    manager.register_type(task_type);
                    say(&format!("Opened '{}'", task_type));
                }
                None => say("Usage: open <type>"),
            },
            Some("shutdown") => {
                manager.request_shutdown();
                say("Shutdown requested.");
            }
            Some("help") => HELP.iter().for_each(|line| say(line)),
            Some("exit") => {
                say("Exiting the program...");
                return Ok(());
            }
            Some(cmd) => say(&format!("Unknown command: {}. Type 'help' for commands.", cmd)),
            None => continue,
        }
    }
}

/// Line editor with history on Up/Down, in raw mode.
fn read_line(commands_history: &[String]) -> io::Result<String> {
    let mut history_index = commands_history.len();
    let mut input = String::new();
    print!("\r>>> ");
    io::stdout().flush()?;

    loop {
        let Event::Key(key_event) = event::read()? else {
            continue;
        };
        if key_event.kind != KeyEventKind::Press {
            continue;
        }
        match key_event.code {
            KeyCode::Enter => {
                print!("\r\n");
                return Ok(input);
            }
            KeyCode::Up => {
                history_index = history_index.saturating_sub(1);
                if let Some(command) = commands_history.get(history_index) {
                    input = command.clone();
                    redraw(&input)?;
                }
            }
            KeyCode::Down => {
                if history_index < commands_history.len() {
                    history_index += 1;
                }
                input = commands_history.get(history_index).cloned().unwrap_or_default();
                redraw(&input)?;
            }
            KeyCode::Char(c) => {
                input.push(c);
                print!("{}", c);
                io::stdout().flush()?;
            }
            KeyCode::Backspace => {
                input.pop();
                redraw(&input)?;
            }
            _ => {}
        }
    }
}

fn redraw(input: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine)
    )?;
    print!(">>> {}", input);
    io::stdout().flush()
}

fn say(line: &str) {
    print!("\r{}\r\n", line);
}

fn rest<'a>(args: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined = args.collect::<Vec<_>>().join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn parse_id(arg: Option<&str>) -> Option<TaskId> {
    arg.and_then(|id| id.parse().ok())
}

fn submit(manager: &TaskManager, task: Task) {
    match manager.submit(task) {
        Ok(task) => {
            say(&format!("Created task with ID: {}", task.id()));
            say(&format!("Use `status {}` to check the status", task.id()));
        }
        Err(e) => say(&format!("Task rejected: {}", e)),
    }
}

fn with_task(manager: &TaskManager, arg: Option<&str>, show: impl FnOnce(&Task)) {
    match parse_id(arg) {
        Some(id) => match manager.find(id) {
            Some(task) => show(task.as_ref()),
            None => say(&format!("Task {} not found", id)),
        },
        None => say("Valid task ID must be specified."),
    }
}
