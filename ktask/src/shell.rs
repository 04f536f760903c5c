// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Console commands for poking at the task subsystem.
//!
//! The embedding kernel's console loop reads lines and hands them to
//! [`eval`]; output goes through the `log` facade under the `shell` target.

use core::fmt;
use core::fmt::Write as _;

use alloc::string::String;

use crate::object_table::ObjectId;
use crate::selftest;
use crate::task::table::task_table;
use crate::time::Instant;

static COMMANDS: &[Command] = &[PS, STOP, UPTIME, SELFTEST];

/// Evaluates one console line.
pub fn eval(line: &str) {
    if line.trim() == "help" {
        log::info!(target: "shell", "available commands:");
        for command in COMMANDS {
            log::info!(target: "shell", "  {command}");
        }
        log::info!(target: "shell", "  help --- prints this help message");
        return;
    }

    match handle_command(Context::new(line), COMMANDS) {
        Ok(()) => {}
        Err(error) => log::error!(target: "shell", "error: {error}"),
    }
}

const PS: Command = Command::new("ps")
    .with_help("list live tasks")
    .with_fn(|_| {
        let mut out = String::new();
        task_table()
            .ps(&mut out)
            .expect("formatting into a String cannot fail");
        for line in out.lines() {
            log::info!(target: "shell", "{line}");
        }
        Ok(())
    });

const STOP: Command = Command::new("stop")
    .with_usage("<PID>")
    .with_help("set a task's stopping flag; the task acts on it at its own pace")
    .with_fn(|mut ctx| {
        let pid = ctx.parse_pid()?;
        let Some(task) = task_table().lookup(pid) else {
            return Err(ctx.other_error("no task with that pid"));
        };
        task.set_stopping();
        log::info!(target: "shell", "task {} ({}) asked to stop", pid, task.name());
        Ok(())
    });

const UPTIME: Command = Command::new("uptime")
    .with_help("time since boot")
    .with_fn(|_| {
        let uptime = Instant::now().duration_since(Instant::ZERO);
        log::info!(
            target: "shell",
            "up {}.{:03}s, {} tasks",
            uptime.as_secs(),
            uptime.subsec_millis(),
            task_table().len()
        );
        Ok(())
    });

const SELFTEST: Command = Command::new("selftest")
    .with_help("run the multitasking self-test (spawns tasks; task context only)")
    .with_fn(|ctx| match selftest::multitasking(2) {
        Ok(()) => Ok(()),
        Err(_) => Err(ctx.other_error("self-test failed, see the log")),
    });

// === impl Command ===

#[derive(Debug)]
pub struct Command<'cmd> {
    name: &'cmd str,
    help: &'cmd str,
    usage: &'cmd str,
    run: fn(Context<'_>) -> CmdResult<'_>,
}

pub type CmdResult<'a> = Result<(), Error<'a>>;

impl<'cmd> Command<'cmd> {
    #[must_use]
    pub const fn new(name: &'cmd str) -> Self {
        #[cold]
        fn missing_run(_ctx: Context<'_>) -> CmdResult<'_> {
            panic!("command is missing its run function, this is a bug");
        }

        Self {
            name,
            help: "",
            usage: "",
            run: missing_run,
        }
    }

    #[must_use]
    pub const fn with_help(self, help: &'cmd str) -> Self {
        Self { help, ..self }
    }

    #[must_use]
    pub const fn with_usage(self, usage: &'cmd str) -> Self {
        Self { usage, ..self }
    }

    #[must_use]
    pub const fn with_fn(self, run: fn(Context<'_>) -> CmdResult<'_>) -> Self {
        Self { run, ..self }
    }
}

impl fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            name, help, usage, ..
        } = self;
        write!(
            f,
            "{name}{usage_pad}{usage} --- {help}",
            usage_pad = if usage.is_empty() { "" } else { " " },
        )
    }
}

fn handle_command<'cmd>(ctx: Context<'cmd>, commands: &'cmd [Command]) -> CmdResult<'cmd> {
    let chunk = ctx.current.trim();
    for cmd in commands {
        if let Some(current) = chunk.strip_prefix(cmd.name) {
            let current = current.trim();
            return (cmd.run)(Context { current, ..ctx });
        }
    }

    Err(ctx.unknown_command(commands))
}

// === impl Context ===

#[derive(Copy, Clone)]
pub struct Context<'cmd> {
    line: &'cmd str,
    current: &'cmd str,
}

impl<'cmd> Context<'cmd> {
    #[must_use]
    pub const fn new(line: &'cmd str) -> Self {
        Self {
            line,
            current: line,
        }
    }

    fn parse_pid(&mut self) -> Result<ObjectId, Error<'cmd>> {
        let chunk = self.current.trim();
        if chunk.is_empty() {
            return Err(self.invalid_argument("expected a pid"));
        }
        match chunk.parse::<usize>() {
            Ok(raw) => Ok(ObjectId::new(raw)),
            Err(_) => Err(self.invalid_argument("expected a decimal pid")),
        }
    }

    fn unknown_command(&self, commands: &'cmd [Command]) -> Error<'cmd> {
        Error {
            line: self.line,
            kind: ErrorKind::UnknownCommand(commands),
        }
    }

    fn invalid_argument(&self, help: &'static str) -> Error<'cmd> {
        Error {
            line: self.line,
            kind: ErrorKind::InvalidArguments {
                arg: self.current,
                help,
            },
        }
    }

    fn other_error(&self, msg: &'static str) -> Error<'cmd> {
        Error {
            line: self.line,
            kind: ErrorKind::Other(msg),
        }
    }
}

// === impl Error ===

#[derive(Debug)]
pub struct Error<'a> {
    line: &'a str,
    kind: ErrorKind<'a>,
}

#[derive(Debug)]
enum ErrorKind<'a> {
    UnknownCommand(&'a [Command<'a>]),
    InvalidArguments { arg: &'a str, help: &'a str },
    Other(&'static str),
}

impl fmt::Display for Error<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { line, kind } = self;
        match kind {
            ErrorKind::UnknownCommand(commands) => {
                write!(f, "unknown command {line:?}, expected one of: [")?;
                let mut names = commands.iter().map(|c| c.name).chain(["help"]);
                if let Some(name) = names.next() {
                    f.write_str(name)?;
                    for name in names {
                        write!(f, ", {name}")?;
                    }
                }
                f.write_char(']')
            }
            ErrorKind::InvalidArguments { arg, help } => {
                write!(f, "invalid argument {arg:?}: {help}")
            }
            ErrorKind::Other(msg) => write!(f, "could not execute {line:?}: {msg}"),
        }
    }
}

impl core::error::Error for Error<'_> {}

/// Exercised by tests; `eval` itself only logs.
#[cfg(test)]
fn try_eval(line: &str) -> CmdResult<'_> {
    handle_command(Context::new(line), COMMANDS)
}
