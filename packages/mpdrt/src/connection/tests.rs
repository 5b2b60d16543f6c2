use super::*;
use crate::scheduler::{ManualPeer, ManualScheduler};
use anyhow::anyhow;
use mpdwire::Reply;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;


type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

fn target() -> Target {
    Target {
        host: "localhost".to_owned(),
        port: 6600,
        password: None,
    }
}

struct Harness {
    sched: Rc<ManualScheduler>,
    conn: Connection,
    peer: ManualPeer,
    group: TaskGroup,
}

impl Harness {
    fn connecting(target: &Target) -> Self {
        let sched = ManualScheduler::new();
        let conn = Connection::new(sched.clone());
        conn.connect(target).unwrap();
        let peer = sched.peer().unwrap();
        let group = conn.new_task_group();
        Harness {
            sched,
            conn,
            peer,
            group,
        }
    }

    fn connected() -> Self {
        let h = Self::connecting(&target());
        h.peer.accept();
        h.peer.send("OK MPD 0.23.5\n");
        assert_eq!(h.conn.state(), ConnectionState::Connected);
        h
    }

    fn run(&self) {
        self.sched.run_until_stalled();
    }

    // the server sends, then every resulting tick runs
    fn reply(&self, data: &str) {
        self.peer.send(data);
        self.run();
    }

    fn written(&self) -> String {
        self.peer.take_written()
    }

    // spawn a task which waits once and logs what matched
    fn waiter(&self, conditions: Vec<Condition>, matched: &Log<Vec<Condition>>) -> TaskHandle {
        let matched = matched.clone();
        self.group
            .spawn(move |cx| async move {
                let conditions = cx.wait_for(conditions).await?;
                matched.borrow_mut().push(conditions);
                Ok(())
            })
            .unwrap()
    }

    // spawn a task which waits once and logs the reason it was disconnected with, if so
    fn disconnect_waiter(
        &self,
        conditions: Vec<Condition>,
        reasons: &Log<Option<DisconnectReason>>,
    ) -> TaskHandle {
        let reasons = reasons.clone();
        self.group
            .spawn(move |cx| async move {
                let result = cx.wait_for(conditions).await;
                reasons.borrow_mut().push(result.err().and_then(|e| e.disconnect_reason()));
                Ok(())
            })
            .unwrap()
    }

    // spawn a task which sends one command and logs the outcome
    fn commander(&self, command: &'static str, results: &Log<Result<Reply, Error>>) -> TaskHandle {
        let results = results.clone();
        self.group
            .spawn(move |cx| async move {
                let result = cx.command(command).await;
                results.borrow_mut().push(result);
                Ok(())
            })
            .unwrap()
    }
}

fn player() -> Vec<Condition> {
    vec![Subsystem::PLAYER.into()]
}

fn mixer() -> Vec<Condition> {
    vec![Subsystem::MIXER.into()]
}

// ==== handshake ====

#[test]
fn handshake_without_password() {
    let h = Harness::connecting(&target());
    assert_eq!(h.conn.state(), ConnectionState::Connecting);
    assert_eq!((h.peer.host(), h.peer.port()), ("localhost", 6600));

    h.peer.accept();
    assert_eq!(h.conn.state(), ConnectionState::Connecting);
    h.peer.send("OK MPD 0.23.5\n");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
    assert_eq!(h.conn.server_version().as_deref(), Some("0.23.5"));
    assert_eq!(h.written(), "");
    assert!(!h.conn.awaiting_idle_reply());
}

#[test]
fn handshake_with_password() {
    let h = Harness::connecting(&Target {
        password: Some("hunter2".to_owned()),
        ..target()
    });
    h.peer.accept();
    h.peer.send("OK MPD 0.23.5\n");
    assert_eq!(h.conn.state(), ConnectionState::Connecting);
    assert_eq!(h.written(), "password hunter2\n");
    h.peer.send("OK\n");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
}

#[test]
fn commands_queued_while_connecting_fail_on_bad_password() {
    let h = Harness::connecting(&Target {
        password: Some("wrong".to_owned()),
        ..target()
    });
    let results = log();
    h.commander("status", &results);
    h.run();
    assert!(results.borrow().is_empty());

    h.peer.accept();
    h.peer.send("OK MPD 0.23.5\n");
    assert_eq!(h.written(), "password wrong\n");
    h.peer.send("ACK [3@0] {password} incorrect password\n");
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h.peer.is_closed());

    h.run();
    assert_eq!(
        *results.borrow(),
        [Err(Error::Disconnect(DisconnectReason::BadPassword))]
    );
}

#[test]
fn commands_queued_while_connecting_are_sent_once_connected() {
    let h = Harness::connecting(&target());
    let results = log();
    h.commander("status", &results);
    h.run();
    h.peer.accept();
    assert_eq!(h.written(), "");
    h.peer.send("OK MPD 0.23.5\n");
    assert_eq!(h.written(), "status\n");
    h.reply("state: stop\nOK\n");
    assert_eq!(results.borrow().len(), 1);
    assert!(results.borrow()[0].is_ok());
}

#[test]
fn garbage_greeting_disconnects() {
    let h = Harness::connecting(&target());
    h.peer.accept();
    h.peer.send("HTTP/1.1 400 Bad Request\n");
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h.peer.is_closed());
}

#[test]
fn overlong_line_disconnects() {
    let sched = ManualScheduler::new();
    let conn = Connection::with_config(sched.clone(), Config { max_line_len: 16 });
    conn.connect(&target()).unwrap();
    let peer = sched.peer().unwrap();
    peer.accept();
    peer.send("OK MPD 0.23.5 and then a great deal more\n");
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

// ==== commands ====

#[test]
fn replies_go_to_issuers_in_order() {
    let h = Harness::connected();
    let results = log();
    for (name, command) in [("a", "status"), ("b", "currentsong")] {
        let results = results.clone();
        h.group
            .spawn(move |cx| async move {
                let reply = cx.command(command).await?;
                results
                    .borrow_mut()
                    .push((name, reply.get("value").map(str::to_owned)));
                Ok(())
            })
            .unwrap();
    }
    h.run();
    assert_eq!(h.written(), "status\n");
    h.reply("value: 1\nOK\n");
    assert_eq!(h.written(), "currentsong\n");
    h.reply("value: 2\nOK\n");
    assert_eq!(
        *results.borrow(),
        [("a", Some("1".to_owned())), ("b", Some("2".to_owned()))]
    );
    assert_eq!(h.written(), "");
}

#[test]
fn randomized_replies_stay_attributed() {
    let mut rng = Pcg32::from_seed(0xdeadbeefdeadbeefdeadbeefdeadbeefu128.to_le_bytes());
    let h = Harness::connected();
    let results: Log<(usize, String)> = log();
    let mut expected = Vec::new();
    for t in 0..8 {
        let count = rng.gen_range(1..5);
        let commands: Vec<String> = (0..count).map(|k| format!("echo {} {}", t, k)).collect();
        expected.push(commands.clone());
        let results = results.clone();
        h.group
            .spawn(move |cx| async move {
                for command in commands {
                    let reply = cx.command(command).await?;
                    let echo = reply.get("echo").unwrap_or_default().to_owned();
                    results.borrow_mut().push((t, echo));
                }
                Ok(())
            })
            .unwrap();
    }
    h.run();

    // answer each command with its own text, delivered in randomly sized pieces
    loop {
        let written = h.written();
        if written.is_empty() {
            break;
        }
        for line in written.lines() {
            let response = format!("echo: {}\nOK\n", line);
            let mut rest = response.as_str();
            while !rest.is_empty() {
                let cut = rng.gen_range(1..=rest.len());
                h.peer.send(&rest[..cut]);
                rest = &rest[cut..];
            }
        }
        h.run();
    }

    for (t, commands) in expected.into_iter().enumerate() {
        let echoed: Vec<String> = results
            .borrow()
            .iter()
            .filter(|(task, _)| *task == t)
            .map(|(_, echo)| echo.clone())
            .collect();
        assert_eq!(echoed, commands);
    }
    assert!(h.group.tasks().is_empty());
}

#[test]
fn ack_fails_only_the_issuing_task() {
    let h = Harness::connected();
    let failed = log();
    let succeeded = log();
    h.commander("play 99", &failed);
    h.commander("status", &succeeded);
    h.run();
    assert_eq!(h.written(), "play 99\n");
    h.reply("ACK [50@0] {play} song doesn't exist: \"99\"\n");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
    assert_eq!(h.written(), "status\n");
    h.reply("state: play\nOK\n");

    match &failed.borrow()[..] {
        [Err(Error::Reply(e))] => {
            assert_eq!(e.code(), 50);
            assert_eq!(e.ack().command, "play");
        }
        other => panic!("unexpected results {:?}", other),
    }
    assert_eq!(succeeded.borrow()[0].as_ref().unwrap().get("state"), Some("play"));
}

#[test]
fn command_list_round_trip() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    h.group
        .spawn(move |cx| async move {
            r.borrow_mut().push(cx.command_list(Vec::<String>::new()).await?);
            r.borrow_mut().push(cx.command_list(["status", "currentsong"]).await?);
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(
        h.written(),
        "command_list_ok_begin\nstatus\ncurrentsong\ncommand_list_end\n"
    );
    h.reply("state: play\nlist_OK\nfile: a.flac\nlist_OK\nOK\n");

    let results = results.borrow();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_empty());
    assert_eq!(results[1].len(), 2);
    assert_eq!(results[1][0].get("state"), Some("play"));
    assert_eq!(results[1][1].get("file"), Some("a.flac"));
}

#[test]
fn command_list_failure_reports_position() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    h.group
        .spawn(move |cx| async move {
            r.borrow_mut().push(cx.command_list(["status", "play 99"]).await);
            Ok(())
        })
        .unwrap();
    h.run();
    h.written();
    h.reply("list_OK\nACK [50@1] {play} song doesn't exist: \"99\"\n");
    match &results.borrow()[..] {
        [Err(Error::Reply(e))] => assert_eq!(e.index(), 1),
        other => panic!("unexpected results {:?}", other),
    }
    assert_eq!(h.conn.state(), ConnectionState::Connected);
}

#[test]
fn commands_fail_fast_while_disconnected() {
    let sched = ManualScheduler::new();
    let conn = Connection::new(sched.clone());
    let results = log();
    let r = results.clone();
    conn.new_task_group()
        .spawn(move |cx| async move {
            r.borrow_mut().push(cx.command("status").await.err());
            r.borrow_mut().push(cx.command_list(["status"]).await.err());
            r.borrow_mut().push(cx.command("two\nlines").await.err());
            Ok(())
        })
        .unwrap();
    sched.run_until_stalled();
    assert_eq!(
        *results.borrow(),
        [
            Some(Error::Usage(UsageError::NotConnected)),
            Some(Error::Usage(UsageError::NotConnected)),
            Some(Error::Usage(UsageError::InvalidCommand("two\nlines".to_owned()))),
        ]
    );
}

#[test]
fn one_request_at_a_time() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    h.group
        .spawn(move |cx| async move {
            let (first, second) = futures::join!(cx.command("status"), cx.command("stats"));
            r.borrow_mut().push((first.is_ok(), second.err()));
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(h.written(), "status\n");
    h.reply("OK\n");
    assert_eq!(
        *results.borrow(),
        [(true, Some(Error::Usage(UsageError::ConcurrentRequest)))]
    );
}

#[test]
fn write_backpressure() {
    let h = Harness::connected();
    h.peer.block_writes(3);
    let results = log();
    h.commander("status", &results);
    h.run();
    assert_eq!(h.written(), "sta");
    assert!(h.peer.wants_write());
    h.peer.unblock_writes();
    assert_eq!(h.written(), "tus\n");
    assert!(!h.peer.wants_write());
}

#[test]
fn unsolicited_line_disconnects() {
    let h = Harness::connected();
    let reasons = log();
    h.disconnect_waiter(vec![Condition::Timeout(Duration::from_secs(60))], &reasons);
    h.run();
    assert_eq!(h.written(), "");

    h.peer.send("OK\n");
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h.peer.is_closed());
    h.run();
    assert_eq!(*reasons.borrow(), [Some(DisconnectReason::Error)]);
}

// ==== idle sharing ====

#[test]
fn waiters_share_one_idle() {
    let h = Harness::connected();
    let matched = log();
    h.waiter(player(), &matched);
    h.waiter(mixer(), &matched);
    h.run();
    assert_eq!(h.written(), "idle mixer player\n");
    assert!(h.conn.awaiting_idle_reply());

    h.reply("changed: player\nOK\n");
    assert_eq!(*matched.borrow(), [vec![Condition::Subsystem(Subsystem::PLAYER)]]);
    assert_eq!(h.written(), "idle mixer\n");
    assert!(h.conn.awaiting_idle_reply());
}

#[test]
fn one_change_wakes_every_interested_waiter() {
    let h = Harness::connected();
    let matched = log();
    h.waiter(player(), &matched);
    h.waiter(vec![Condition::Any, Subsystem::MIXER.into()], &matched);
    h.run();
    assert_eq!(h.written(), "idle\n");

    h.reply("changed: player\nchanged: options\nOK\n");
    assert_eq!(
        *matched.borrow(),
        [vec![Condition::Subsystem(Subsystem::PLAYER)], vec![Condition::Any]]
    );
    assert_eq!(h.written(), "");
    assert!(!h.conn.awaiting_idle_reply());
}

#[test]
fn idle_issued_when_first_waiter_arrives() {
    let h = Harness::connected();
    h.run();
    assert_eq!(h.written(), "");
    assert!(!h.conn.awaiting_idle_reply());

    h.waiter(vec![Condition::Any], &log());
    h.run();
    assert_eq!(h.written(), "idle\n");
    assert!(h.conn.awaiting_idle_reply());
}

#[test]
fn idle_cancelled_when_last_waiter_leaves() {
    let h = Harness::connected();
    let waiter = h.waiter(player(), &log());
    h.run();
    assert_eq!(h.written(), "idle player\n");

    waiter.kill();
    assert_eq!(h.written(), "noidle\n");
    assert!(h.conn.awaiting_idle_reply());
    h.reply("OK\n");
    assert!(!h.conn.awaiting_idle_reply());
    assert_eq!(h.written(), "");
}

#[test]
fn new_subsystem_extends_the_filter() {
    let h = Harness::connected();
    h.waiter(player(), &log());
    h.run();
    assert_eq!(h.written(), "idle player\n");

    h.waiter(mixer(), &log());
    h.run();
    assert_eq!(h.written(), "noidle\n");

    // already cancelling, so no second noidle
    h.waiter(vec![Subsystem::OPTIONS.into()], &log());
    h.run();
    assert_eq!(h.written(), "");

    h.reply("OK\n");
    assert_eq!(h.written(), "idle mixer options player\n");
}

#[test]
fn waiter_already_covered_leaves_idle_alone() {
    let h = Harness::connected();
    h.waiter(vec![Condition::Any], &log());
    h.run();
    assert_eq!(h.written(), "idle\n");
    h.waiter(player(), &log());
    h.run();
    assert_eq!(h.written(), "");
}

#[test]
fn idle_rejection_fails_only_its_waiters() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    h.group
        .spawn(move |cx| async move {
            r.borrow_mut().push(cx.wait_for([Condition::subsystem("bogus")]).await);
            Ok(())
        })
        .unwrap();
    let bystander = h.waiter(vec![Condition::Timeout(Duration::from_secs(60))], &log());
    h.run();
    assert_eq!(h.written(), "idle bogus\n");

    h.reply("ACK [2@0] {idle} Unrecognized idle event: bogus\n");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
    match &results.borrow()[..] {
        [Err(Error::Reply(e))] => assert_eq!(e.code(), 2),
        other => panic!("unexpected results {:?}", other),
    }
    assert!(bystander.is_alive());
    assert_eq!(h.written(), "");
    assert!(!h.conn.awaiting_idle_reply());

    h.waiter(player(), &log());
    h.run();
    assert_eq!(h.written(), "idle player\n");
}

#[test]
fn command_cancels_idle_then_runs() {
    let h = Harness::connected();
    let matched = log();
    h.waiter(player(), &matched);
    h.run();
    assert_eq!(h.written(), "idle player\n");

    let results = log();
    h.commander("status", &results);
    h.run();
    assert_eq!(h.written(), "noidle\n");

    // a change that raced the cancellation still reaches its waiter
    h.reply("changed: player\nOK\n");
    assert_eq!(*matched.borrow(), [vec![Condition::Subsystem(Subsystem::PLAYER)]]);
    assert_eq!(h.written(), "status\n");
    h.reply("state: stop\nOK\n");
    assert_eq!(results.borrow().len(), 1);
    assert_eq!(h.written(), "");
    assert!(!h.conn.awaiting_idle_reply());
}

#[test]
fn idle_resumes_after_commands_drain() {
    let h = Harness::connected();
    let matched = log();
    h.waiter(mixer(), &matched);
    h.run();
    assert_eq!(h.written(), "idle mixer\n");

    h.commander("status", &log());
    h.run();
    assert_eq!(h.written(), "noidle\n");
    h.reply("OK\n");
    assert_eq!(h.written(), "status\n");
    h.reply("OK\n");
    assert_eq!(h.written(), "idle mixer\n");
    assert!(matched.borrow().is_empty());
}

// ==== other conditions ====

#[test]
fn timeout_wakes_waiter_and_cancels_idle() {
    let h = Harness::connected();
    let matched = log();
    h.waiter(
        vec![Subsystem::PLAYER.into(), Condition::Timeout(Duration::from_millis(500))],
        &matched,
    );
    h.run();
    assert_eq!(h.written(), "idle player\n");

    assert_eq!(h.sched.advance(Duration::from_millis(499)), 0);
    assert!(matched.borrow().is_empty());
    h.sched.advance(Duration::from_millis(1));
    assert_eq!(
        *matched.borrow(),
        [vec![Condition::Timeout(Duration::from_millis(500))]]
    );
    assert_eq!(h.written(), "noidle\n");
}

#[test]
fn change_before_timeout_removes_the_timer() {
    let h = Harness::connected();
    let matched = log();
    h.waiter(
        vec![Condition::Timeout(Duration::from_secs(5)), Subsystem::PLAYER.into()],
        &matched,
    );
    h.run();
    assert_eq!(h.sched.pending_timers(), 1);
    h.reply("changed: player\nOK\n");
    assert_eq!(*matched.borrow(), [vec![Condition::Subsystem(Subsystem::PLAYER)]]);
    assert_eq!(h.sched.pending_timers(), 0);
}

#[test]
fn already_true_conditions_resolve_in_the_same_tick() {
    let h = Harness::connected();
    let matched = log();
    let m = matched.clone();
    h.group
        .spawn(move |cx| async move {
            m.borrow_mut().push(cx.wait_for([Condition::Connect]).await?);
            let conditions = [Condition::Any, Condition::Timeout(Duration::ZERO)];
            m.borrow_mut().push(cx.wait_for(conditions).await?);
            Ok(())
        })
        .unwrap();
    assert_eq!(h.sched.run_until_stalled(), 1);
    assert_eq!(
        *matched.borrow(),
        [vec![Condition::Connect], vec![Condition::Timeout(Duration::ZERO)]]
    );
    assert_eq!(h.written(), "");
}

#[test]
fn empty_wait_is_rejected() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    h.group
        .spawn(move |cx| async move {
            r.borrow_mut().push(cx.wait_for(Vec::new()).await.err());
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(
        *results.borrow(),
        [Some(Error::Usage(UsageError::NoConditions))]
    );
}

#[test]
fn malformed_subsystem_is_rejected_before_the_wire() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    h.group
        .spawn(move |cx| async move {
            let conditions = [Condition::Any, Condition::subsystem("player\nclear")];
            r.borrow_mut().push(cx.wait_for(conditions).await.err());
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(
        *results.borrow(),
        [Some(Error::Usage(UsageError::InvalidSubsystem("PLAYER\nCLEAR".to_owned())))]
    );
    assert_eq!(h.written(), "");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
}

#[test]
fn connect_waiters_resume_once_connected() {
    let h = Harness::connecting(&target());
    let matched = log();
    h.waiter(vec![Condition::Connect], &matched);
    h.run();
    h.peer.accept();
    h.run();
    assert!(matched.borrow().is_empty());

    h.reply("OK MPD 0.23.5\n");
    assert_eq!(*matched.borrow(), [vec![Condition::Connect]]);
}

#[test]
fn worker_condition_waits_for_tasks_to_end() {
    let h = Harness::connected();
    let worker = h.commander("update", &log());
    let matched = log();
    h.waiter(vec![worker.finished()], &matched);
    h.run();
    assert_eq!(h.written(), "update\n");
    assert!(matched.borrow().is_empty());

    h.reply("updating_db: 1\nOK\n");
    assert!(!worker.is_alive());
    assert_eq!(*matched.borrow(), [vec![Condition::Worker(vec![worker.id()])]]);

    // already ended, so holds at once
    h.waiter(vec![Condition::worker([worker.id()])], &matched);
    h.run();
    assert_eq!(matched.borrow().len(), 2);
}

#[test]
fn idle_condition_waits_for_a_quiet_wire() {
    let h = Harness::connected();
    h.commander("status", &log());
    let matched = log();
    h.waiter(vec![Condition::Idle], &matched);
    h.run();
    assert_eq!(h.written(), "status\n");
    assert!(matched.borrow().is_empty());

    h.reply("OK\n");
    assert_eq!(*matched.borrow(), [vec![Condition::Idle]]);
    assert_eq!(h.written(), "");
}

// ==== disconnects ====

#[test]
fn disconnect_fails_every_pending_request_once() {
    let h = Harness::connected();
    let reasons = log();
    for command in ["status", "stats", "currentsong"] {
        let reasons = reasons.clone();
        h.group
            .spawn(move |cx| async move {
                let result = cx.command(command).await;
                reasons.borrow_mut().push(result.err().and_then(|e| e.disconnect_reason()));
                Ok(())
            })
            .unwrap();
    }
    h.disconnect_waiter(vec![Condition::Any], &reasons);
    h.disconnect_waiter(vec![Condition::Timeout(Duration::from_secs(60))], &reasons);
    h.run();
    assert_eq!(h.written(), "status\n");

    h.conn.disconnect(DisconnectReason::Requested);
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(!h.conn.awaiting_idle_reply());
    assert!(h.peer.is_closed());
    h.run();
    assert_eq!(*reasons.borrow(), vec![Some(DisconnectReason::Requested); 5]);
    assert_eq!(h.sched.pending_timers(), 0);
    assert!(h.group.tasks().is_empty());
}

#[test]
fn disconnect_during_idle() {
    let h = Harness::connected();
    let reasons = log();
    h.disconnect_waiter(player(), &reasons);
    h.run();
    assert!(h.conn.awaiting_idle_reply());
    h.conn.disconnect(DisconnectReason::Requested);
    assert!(!h.conn.awaiting_idle_reply());
    h.run();
    assert_eq!(*reasons.borrow(), [Some(DisconnectReason::Requested)]);
}

#[test]
fn server_hangup_fails_pending_with_error() {
    let h = Harness::connected();
    let results = log();
    h.commander("status", &results);
    h.commander("stats", &results);
    h.run();

    // the first reply arrives complete just before the end of stream
    h.peer.send("state: play\nOK\n");
    h.peer.close_remote();
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    h.run();
    let results = results.borrow();
    assert!(results[0].is_ok());
    assert_eq!(
        results[1],
        Err(Error::Disconnect(DisconnectReason::Error))
    );
}

#[test]
fn reconnecting_fails_pending_with_reconnect() {
    let h = Harness::connected();
    let results = log();
    h.commander("status", &results);
    h.run();
    assert_eq!(h.written(), "status\n");

    h.conn.connect(&target()).unwrap();
    assert!(h.peer.is_closed());
    assert_eq!(h.conn.state(), ConnectionState::Connecting);
    assert_eq!(h.conn.server_version(), None);
    h.run();
    assert_eq!(
        *results.borrow(),
        [Err(Error::Disconnect(DisconnectReason::Reconnect))]
    );

    assert_eq!(h.sched.peers().len(), 2);
    let peer = h.sched.peer().unwrap();
    peer.accept();
    peer.send("OK MPD 0.24.0\n");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
    assert_eq!(h.conn.server_version().as_deref(), Some("0.24.0"));
}

#[test]
fn failed_connects() {
    let sched = ManualScheduler::new();
    let conn = Connection::new(sched.clone());
    let reasons = log();
    let r = reasons.clone();
    conn.new_task_group()
        .spawn(move |cx| async move {
            let result = cx.wait_for([Condition::Connect]).await;
            r.borrow_mut().push(result.err().and_then(|e| e.disconnect_reason()));
            Ok(())
        })
        .unwrap();
    sched.run_until_stalled();

    conn.connect(&target()).unwrap();
    sched.peer().unwrap().fail(io::ErrorKind::ConnectionRefused);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    sched.run_until_stalled();
    assert_eq!(*reasons.borrow(), [Some(DisconnectReason::FailedConnect)]);

    sched.fail_connects(Some(io::ErrorKind::AddrNotAvailable));
    assert_eq!(
        conn.connect(&target()),
        Err(Error::Disconnect(DisconnectReason::FailedConnect))
    );
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[test]
fn socket_error_after_connecting_is_an_error() {
    let h = Harness::connected();
    let reasons = log();
    h.disconnect_waiter(player(), &reasons);
    h.run();
    h.peer.fail(io::ErrorKind::ConnectionReset);
    h.run();
    assert_eq!(*reasons.borrow(), [Some(DisconnectReason::Error)]);
}

#[test]
fn shutdown_closes_every_group() {
    let h = Harness::connected();
    let other = h.conn.new_task_group();
    let waiter = h.waiter(vec![Condition::Any], &log());
    let exited = Rc::new(Cell::new(false));
    let e = exited.clone();
    waiter.add_exit_callback(move || e.set(true));
    other
        .spawn(|cx| async move {
            cx.wait_for([Condition::Subsystem(Subsystem::MIXER)]).await?;
            Ok(())
        })
        .unwrap();
    h.run();

    let errors = log();
    let errs = errors.clone();
    h.conn.set_error_hook(move |task, _| errs.borrow_mut().push(task));
    h.conn.shutdown();
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
    assert!(h.group.is_closed());
    assert!(other.is_closed());
    assert!(!waiter.is_alive());
    assert!(exited.get());
    h.run();
    assert!(errors.borrow().is_empty());
}

// ==== tasks and groups ====

#[test]
fn spawned_body_starts_on_a_later_tick() {
    let h = Harness::connected();
    let started = Rc::new(Cell::new(false));
    let s = started.clone();
    let task = h
        .group
        .spawn(move |_| async move {
            s.set(true);
            Ok(())
        })
        .unwrap();
    assert!(!started.get());
    assert!(task.is_alive());
    h.run();
    assert!(started.get());
    assert!(!task.is_alive());
}

#[test]
fn current_task_is_the_spawned_task() {
    let h = Harness::connected();
    let results = log();
    let r = results.clone();
    let task = h
        .group
        .spawn(move |cx| async move {
            let me = cx.current_task().await?;
            r.borrow_mut().push((me.clone(), cx.id(), me.is_alive()));
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(*results.borrow(), [(task.clone(), task.id(), true)]);
}

#[test]
fn kill_is_idempotent() {
    let h = Harness::connected();
    let task = h.waiter(vec![Condition::Any], &log());
    let exits = Rc::new(Cell::new(0));
    for _ in 0..2 {
        let exits = exits.clone();
        task.add_exit_callback(move || exits.set(exits.get() + 1));
    }
    h.run();
    task.kill();
    task.kill();
    assert_eq!(exits.get(), 2);
    assert!(!task.is_alive());

    // registering on an ended task runs at once
    let e = exits.clone();
    task.add_exit_callback(move || e.set(e.get() + 10));
    assert_eq!(exits.get(), 12);
    h.run();
    assert!(h.group.tasks().is_empty());
}

#[test]
fn exit_callbacks_run_in_order() {
    let h = Harness::connected();
    let task = h.waiter(player(), &log());
    let order = log();
    for i in 0..3 {
        let order = order.clone();
        task.add_exit_callback(move || order.borrow_mut().push(i));
    }
    task.kill();
    assert_eq!(*order.borrow(), [0, 1, 2]);
}

#[test]
fn kill_from_sibling_exit_discards_reply() {
    let h = Harness::connected();
    let resumed = Rc::new(Cell::new(false));
    let r = resumed.clone();
    let victim = h
        .group
        .spawn(move |cx| async move {
            cx.command("status").await?;
            r.set(true);
            Ok(())
        })
        .unwrap();
    let victim_exits = Rc::new(Cell::new(0));
    let e = victim_exits.clone();
    victim.add_exit_callback(move || e.set(e.get() + 1));

    let sibling = h.waiter(vec![Condition::Timeout(Duration::from_millis(10))], &log());
    let v = victim.clone();
    sibling.add_exit_callback(move || v.kill());
    h.run();
    assert_eq!(h.written(), "status\n");

    h.sched.advance(Duration::from_millis(10));
    assert!(!sibling.is_alive());
    assert!(!victim.is_alive());
    assert_eq!(victim_exits.get(), 1);

    // the withdrawn reply is consumed without disturbing the next request
    let results = log();
    h.commander("stats", &results);
    h.run();
    assert_eq!(h.written(), "");
    h.reply("state: play\nOK\n");
    assert_eq!(h.conn.state(), ConnectionState::Connected);
    assert!(!resumed.get());
    assert_eq!(h.written(), "stats\n");
    h.reply("songs: 3\nOK\n");
    assert_eq!(results.borrow()[0].as_ref().unwrap().get("songs"), Some("3"));
}

#[test]
fn killing_a_task_drops_its_unwritten_command() {
    let h = Harness::connected();
    let first = h.commander("status", &log());
    let second = h.commander("stats", &log());
    h.run();
    assert_eq!(h.written(), "status\n");
    second.kill();
    h.reply("OK\n");
    assert!(!first.is_alive());
    assert_eq!(h.written(), "");
}

#[test]
fn task_may_kill_itself() {
    let h = Harness::connected();
    let continued = Rc::new(Cell::new(false));
    let c = continued.clone();
    let task = h
        .group
        .spawn(move |cx| async move {
            let me = cx.current_task().await?;
            me.kill();
            c.set(true);
            cx.wait_for([Condition::Any]).await?;
            c.set(false);
            Ok(())
        })
        .unwrap();
    let exited = Rc::new(Cell::new(false));
    let e = exited.clone();
    task.add_exit_callback(move || e.set(true));
    h.run();
    assert!(exited.get());
    // the body runs on until it next suspends, then is dropped
    assert!(continued.get());
    assert!(!task.is_alive());
    assert_eq!(h.written(), "");
}

#[test]
fn closing_a_group_kills_its_tasks() {
    let h = Harness::connected();
    let a = h.waiter(vec![Condition::Any], &log());
    let b = h.waiter(player(), &log());
    h.run();
    assert_eq!(h.group.tasks(), [a.clone(), b.clone()]);
    assert_eq!(h.written(), "idle\n");

    h.group.close();
    h.group.close();
    assert!(h.group.is_closed());
    assert!(!a.is_alive());
    assert!(!b.is_alive());
    assert_eq!(h.written(), "noidle\n");
    assert_eq!(
        h.group.spawn(|_| async { Ok(()) }).unwrap_err(),
        Error::Usage(UsageError::GroupClosed)
    );
}

#[test]
fn dropped_group_handle_leaves_tasks_running() {
    let h = Harness::connected();
    let task = h
        .conn
        .new_task_group()
        .spawn(|cx| async move {
            cx.wait_for([Condition::Subsystem(Subsystem::MIXER)]).await?;
            Ok(())
        })
        .unwrap();
    h.run();
    assert!(task.is_alive());
    assert_eq!(h.written(), "idle mixer\n");

    h.conn.shutdown();
    assert!(!task.is_alive());
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
}

#[test]
fn owned_groups_close_with_their_owner() {
    let h = Harness::connected();
    let children: Log<TaskHandle> = log();
    let c = children.clone();
    let parent = h
        .group
        .spawn(move |cx| async move {
            let group = cx.new_task_group()?;
            for _ in 0..2 {
                let child = group.spawn(|cx| async move {
                    cx.wait_for([Condition::Subsystem(Subsystem::MIXER)]).await?;
                    Ok(())
                })?;
                c.borrow_mut().push(child);
            }
            cx.wait_for([Condition::Subsystem(Subsystem::PLAYER)]).await?;
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(children.borrow().len(), 2);
    assert!(children.borrow().iter().all(TaskHandle::is_alive));
    assert_eq!(h.written(), "idle mixer player\n");

    h.reply("changed: player\nOK\n");
    assert!(!parent.is_alive());
    assert!(children.borrow().iter().all(|child| !child.is_alive()));
    assert_eq!(h.written(), "");
}

#[test]
fn uncaught_errors_reach_the_hook() {
    let h = Harness::connected();
    let errors: Log<(TaskId, String)> = log();
    let e = errors.clone();
    h.conn
        .set_error_hook(move |task, error| e.borrow_mut().push((task, error.to_string())));

    let failing = h.group.spawn(|_| async { Err(anyhow!("boom")) }).unwrap();
    let acked = h
        .group
        .spawn(|cx| async move {
            cx.command("play 99").await?;
            Ok(())
        })
        .unwrap();
    let killed = h.waiter(player(), &log());
    h.run();
    killed.kill();
    h.reply("ACK [50@0] {play} song doesn't exist: \"99\"\n");

    let errors = errors.borrow();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0], (failing.id(), "boom".to_owned()));
    assert_eq!(errors[1].0, acked.id());
    assert!(errors[1].1.contains("song doesn't exist"));
}

#[test]
fn awaiting_a_foreign_future_fails_the_task() {
    let h = Harness::connected();
    let errors: Log<Option<Error>> = log();
    let e = errors.clone();
    h.conn.set_error_hook(move |_, error| {
        e.borrow_mut().push(error.downcast_ref::<Error>().cloned())
    });
    let task = h
        .group
        .spawn(|_| async {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .unwrap();
    h.run();
    assert_eq!(
        *errors.borrow(),
        [Some(Error::Usage(UsageError::ForeignAwait))]
    );
    assert!(!task.is_alive());
}
