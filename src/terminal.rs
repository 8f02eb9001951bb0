//! A presenter for running the daemon in a terminal.
//!
//! Ringing alarms are printed to stdout. The user answers with one line per
//! alarm on stdin: `d <id>` dismisses, `s <id>` snoozes.

use std::{
    collections::HashMap,
    io::{self, BufRead},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::{
    alarm::{format_millis, AlarmId, AlarmRecord},
    delivery::{Presenter, UserChoice},
};

type Waiting = Arc<Mutex<HashMap<AlarmId, Sender<Option<UserChoice>>>>>;

#[derive(Debug, Clone, Default)]
pub struct TerminalPresenter {
    waiting: Waiting,
}

impl TerminalPresenter {
    /// starts reading answers from stdin
    ///
    /// # Errors
    /// if the reader thread can't be spawned
    pub fn spawn() -> io::Result<Self> {
        let presenter = Self::default();
        let waiting = Arc::clone(&presenter.waiting);
        thread::Builder::new()
            .name("alarm-stdin".to_string())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    match line {
                        Ok(line) => answer(&waiting, &line),
                        Err(err) => {
                            warn!("couldn't read stdin: {err}");
                            break;
                        }
                    }
                }
                info!("stdin closed, ringing alarms can only time out now");
            })?;
        Ok(presenter)
    }
}

fn answer(waiting: &Waiting, line: &str) {
    let Some((choice, id)) = parse_command(line) else {
        if !line.trim().is_empty() {
            println!("expected `d <id>` to dismiss or `s <id>` to snooze");
        }
        return;
    };
    let sender = waiting
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    match sender {
        Some(sender) => {
            let _ = sender.send(Some(choice));
        }
        None => println!("alarm {id} isn't ringing"),
    }
}

/// `d 7` / `dismiss 7` / `s 7` / `snooze 7`
#[must_use]
pub fn parse_command(line: &str) -> Option<(UserChoice, AlarmId)> {
    let mut words = line.split_whitespace();
    let choice = match words.next()?.to_ascii_lowercase().as_str() {
        "d" | "dismiss" => UserChoice::Dismiss,
        "s" | "snooze" => UserChoice::Snooze,
        _ => return None,
    };
    let id = words.next()?.parse().ok()?;
    if words.next().is_some() {
        return None;
    }
    Some((choice, id))
}

impl Presenter for TerminalPresenter {
    fn present(&self, alarm: &AlarmRecord) -> Option<UserChoice> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if let Some(previous) = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alarm.id, tx)
        {
            let _ = previous.send(None);
        }
        println!(
            "\u{7}🔔 {} ({})\n   {}\n   [d {id}] dismiss   [s {id}] snooze 5 minutes",
            alarm.title,
            format_millis(alarm.fire_at),
            alarm.body,
            id = alarm.id,
        );
        let choice = rx.recv().unwrap_or(None);
        debug!("alarm {} answered with {choice:?}", alarm.id);
        choice
    }

    fn stop_alert(&self, id: AlarmId) {
        let sender = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(sender) = sender {
            println!("alarm {id} stopped");
            let _ = sender.send(None);
        }
    }
}
