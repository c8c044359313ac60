//! End-to-end tests: a real server on a loopback port, driven by small
//! blocking IRC clients.
//!
//! Each test starts its own server on an ephemeral port, so tests are
//! independent and can run in parallel.

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use shoal::config::{Config, OperRecord};
use shoal::irc::server::{self, Server};

/// Simple blocking IRC client for testing.
struct TestClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl TestClient {
    /// Connect without registering.
    fn connect_raw(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(
            &format!("127.0.0.1:{port}").parse().unwrap(),
            Duration::from_secs(5),
        )?;
        stream.set_read_timeout(Some(Duration::from_secs(3)))?;
        let writer = stream.try_clone()?;
        let reader = BufReader::new(stream);
        Ok(Self { reader, writer })
    }

    /// Connect and register, reading through the end of the MOTD.
    fn connect(port: u16, nick: &str) -> io::Result<Self> {
        let mut client = Self::connect_raw(port)?;
        client.send(&format!("NICK {nick}"))?;
        client.send(&format!("USER {nick} 0 * :{nick}"))?;
        client.expect("376");
        Ok(client)
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{line}\r")?;
        self.writer.flush()
    }

    /// Read one line, or None on timeout/EOF.
    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_owned()),
            Err(_) => None,
        }
    }

    /// Read until a line containing `token` appears; panics on timeout.
    /// Returns every line read, the matching one last.
    fn read_until(&mut self, token: &str) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match self.read_line() {
                Some(line) => {
                    let done = line.contains(token);
                    lines.push(line);
                    if done {
                        return lines;
                    }
                }
                None => panic!("timed out waiting for {token:?}; got {lines:#?}"),
            }
        }
    }

    /// Read until a line containing `token` appears and return it.
    fn expect(&mut self, token: &str) -> String {
        self.read_until(token).pop().unwrap()
    }

    /// Assert the connection is closed (EOF within the read timeout).
    fn expect_eof(&mut self) {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) => panic!("expected EOF, got error {e}"),
            }
        }
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.name = "irc.shoal.test".into();
    config.server.listen.host = "127.0.0.1".into();
    config.server.listen.port = 0;
    config
}

async fn spawn_server(config: Config) -> (Arc<Server>, u16) {
    let running = server::start(config, None).await.expect("server starts");
    (running.server, running.addr.port())
}

// ── Scenario: registration, join, privmsg ────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registration_join_and_privmsg() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect_raw(port).unwrap();
    alice.send("NICK alice").unwrap();
    alice.send("USER alice 0 * :Alice").unwrap();

    // 001 through MOTD end.
    let greeting = alice.read_until("376");
    assert!(greeting.iter().any(|l| l.contains(" 001 alice ")));
    assert!(greeting.iter().any(|l| l.contains(" 004 ")));
    assert!(greeting.iter().any(|l| l.contains(" 005 ")));
    assert!(greeting.iter().any(|l| l.contains(" 375 ")));

    // First joiner gets ops.
    alice.send("JOIN #room").unwrap();
    alice.expect("JOIN");
    let names = alice.expect(" 353 ");
    assert!(names.contains("@alice"), "{names}");
    alice.expect(" 366 ");

    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("JOIN #room").unwrap();
    bob.expect("JOIN");
    let names = bob.expect(" 353 ");
    assert!(names.contains("@alice"), "{names}");
    assert!(names.contains("bob"), "{names}");
    bob.expect(" 366 ");

    // alice sees bob arrive.
    let join = alice.expect("JOIN");
    assert!(join.starts_with(":bob!bob@"), "{join}");

    // The message reaches bob, and only bob.
    alice.send("PRIVMSG #room :hi").unwrap();
    let msg = bob.expect("PRIVMSG");
    assert!(msg.starts_with(":alice!alice@"), "{msg}");
    assert!(msg.ends_with("PRIVMSG #room :hi"), "{msg}");

    alice.send("PING :sync").unwrap();
    let lines = alice.read_until("PONG");
    assert!(
        !lines.iter().any(|l| l.contains("PRIVMSG #room")),
        "sender was not excluded: {lines:#?}"
    );
}

// ── Scenario: nickname collision ─────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nickname_collision_gets_433() {
    let (_server, port) = spawn_server(test_config()).await;

    let _alice = TestClient::connect(port, "alice").unwrap();

    let mut imposter = TestClient::connect_raw(port).unwrap();
    imposter.send("NICK alice").unwrap();
    let line = imposter.expect(" 433 ");
    assert!(line.contains("433 * alice"), "{line}");
    assert!(line.contains("Nickname is already in use"), "{line}");

    // A different nick still works.
    imposter.send("NICK alice2").unwrap();
    imposter.send("USER alice2 0 * :Second").unwrap();
    imposter.expect(" 001 ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nick_change_is_announced_to_shared_channels() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");
    alice.expect("JOIN");

    bob.send("NICK robert").unwrap();
    let seen = alice.expect("NICK");
    assert!(seen.starts_with(":bob!bob@"), "{seen}");
    assert!(seen.ends_with("NICK :robert"), "{seen}");

    // The old nick is free again.
    let mut carol = TestClient::connect_raw(port).unwrap();
    carol.send("NICK bob").unwrap();
    carol.send("USER bob 0 * :Bob II").unwrap();
    carol.expect(" 001 ");
}

// ── Scenario: moderated channel ──────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn moderated_channel_requires_voice() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    alice.send("MODE #room +m").unwrap();
    alice.expect("MODE #room :+m");

    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");
    alice.expect("JOIN");

    // No voice: rejected with the +m tag.
    bob.send("PRIVMSG #room :x").unwrap();
    let err = bob.expect(" 404 ");
    assert!(err.contains("Cannot send to channel (+m)"), "{err}");

    // Voice bob; his next message goes through.
    alice.send("MODE #room +v bob").unwrap();
    bob.expect("MODE #room +v :bob");

    bob.send("PRIVMSG #room :can you hear me now").unwrap();
    let msg = alice.expect("PRIVMSG");
    assert!(msg.ends_with(":can you hear me now"), "{msg}");
}

// ── Scenario: invite-only ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invite_only_channel_admits_invited_user() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    alice.send("MODE #room +i").unwrap();
    alice.expect("MODE #room :+i");

    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("JOIN #room").unwrap();
    let err = bob.expect(" 473 ");
    assert!(err.contains("Cannot join channel (+i)"), "{err}");

    alice.send("INVITE bob #room").unwrap();
    alice.expect(" 341 ");
    let invite = bob.expect("INVITE");
    assert!(invite.starts_with(":alice!alice@"), "{invite}");

    bob.send("JOIN #room").unwrap();
    bob.expect("JOIN");
    bob.expect(" 366 ");
    let join = alice.expect("JOIN");
    assert!(join.starts_with(":bob!bob@"), "{join}");
}

// ── Channel key and ban list ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_key_is_enforced() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    alice.send("JOIN #vault").unwrap();
    alice.expect(" 366 ");
    alice.send("MODE #vault +k sekrit").unwrap();
    alice.expect("MODE #vault +k");

    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("JOIN #vault").unwrap();
    bob.expect(" 475 ");

    bob.send("JOIN #vault sekrit").unwrap();
    bob.expect("JOIN");
    bob.expect(" 366 ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn banned_user_cannot_join() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    alice.send("MODE #room +b bob!*@*").unwrap();
    alice.expect("MODE #room +b");

    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("JOIN #room").unwrap();
    let err = bob.expect(" 474 ");
    assert!(err.contains("Cannot join channel (+b)"), "{err}");

    // Lifting the ban lets bob in.
    alice.send("MODE #room -b bob!*@*").unwrap();
    alice.expect("MODE #room -b");
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");
}

// ── Topic ────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn topic_set_broadcast_and_query() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");
    alice.expect("JOIN");

    alice.send("TOPIC #room :welcome to the room").unwrap();
    let change = bob.expect("TOPIC");
    assert!(change.ends_with("TOPIC #room :welcome to the room"), "{change}");

    bob.send("TOPIC #room").unwrap();
    let topic = bob.expect(" 332 ");
    assert!(topic.ends_with(":welcome to the room"), "{topic}");
    bob.expect(" 333 ");

    // Default modes include +t: a plain member cannot set the topic.
    bob.send("TOPIC #room :hostile takeover").unwrap();
    bob.expect(" 482 ");
}

// ── Kick ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kick_removes_the_target() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");
    alice.expect("JOIN");

    // A plain member cannot kick.
    bob.send("KICK #room alice :revolt").unwrap();
    bob.expect(" 482 ");

    alice.send("KICK #room bob :bye").unwrap();
    let kicked = bob.expect("KICK");
    assert!(kicked.ends_with("KICK #room bob :bye"), "{kicked}");

    // bob really is out: speaking now fails the membership check.
    bob.send("PRIVMSG #room :still here?").unwrap();
    bob.expect(" 404 ");
}

// ── Quit propagation ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quit_reason_reaches_channel_peers() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();
    alice.send("JOIN #room").unwrap();
    alice.expect(" 366 ");
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");
    alice.expect("JOIN");

    bob.send("QUIT :gone fishing").unwrap();
    let quit = alice.expect("QUIT");
    assert!(quit.starts_with(":bob!bob@"), "{quit}");
    assert!(quit.ends_with("QUIT :gone fishing"), "{quit}");
}

// ── JOIN 0 ───────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_zero_parts_everything() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();
    alice.send("JOIN #one,#two").unwrap();
    alice.expect(" 366 ");
    alice.expect(" 366 ");
    bob.send("JOIN #one").unwrap();
    bob.expect(" 366 ");
    alice.expect("JOIN");

    alice.send("JOIN 0").unwrap();
    let part = bob.expect("PART");
    assert!(part.starts_with(":alice!alice@"), "{part}");

    // alice can no longer speak in #one without rejoining (+n default).
    alice.expect("PART");
    alice.expect("PART");
    alice.send("PRIVMSG #one :ghost").unwrap();
    alice.expect(" 404 ");
}

// ── Operator rank guard ──────────────────────────────────────────

fn write_oper_classes() -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "shoal-oper-classes-{}-{:?}.json",
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::write(
        &path,
        r#"{
            "classes": [
                {"name": "admin", "rank": 4, "permissions": ["*"]},
                {"name": "owner", "rank": 5, "permissions": ["*", "override_rank"]}
            ]
        }"#,
    )
    .unwrap();
    path
}

fn oper_config() -> Config {
    let mut config = test_config();
    config.oper_config.enable = true;
    config.oper_config.file = write_oper_classes().display().to_string();
    config.opers = vec![
        OperRecord {
            name: "root".into(),
            password: "rootpw".into(),
            host: "*".into(),
            class: Some("owner".into()),
            flags: vec![],
        },
        OperRecord {
            name: "admin".into(),
            password: "adminpw".into(),
            host: "*".into(),
            class: Some("admin".into()),
            flags: vec![],
        },
    ];
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kill_respects_operator_ranks() {
    let (_server, port) = spawn_server(oper_config()).await;

    let mut root = TestClient::connect(port, "root").unwrap();
    root.send("OPER root rootpw").unwrap();
    root.expect(" 381 ");

    let mut admin = TestClient::connect(port, "admin").unwrap();
    admin.send("OPER admin adminpw").unwrap();
    admin.expect(" 381 ");

    // rank 4 cannot kill rank 5.
    admin.send("KILL root :coup").unwrap();
    let denied = admin.expect(" 483 ");
    assert!(denied.contains("You can't kill other operators"), "{denied}");

    // rank 5 kills rank 4.
    root.send("KILL admin :cleanup").unwrap();
    let killed = admin.expect("ERROR");
    assert!(killed.contains("Killed (root (cleanup))"), "{killed}");
    admin.expect_eof();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oper_login_sets_modes_and_snomasks() {
    let (_server, port) = spawn_server(oper_config()).await;

    let mut root = TestClient::connect(port, "root").unwrap();
    root.send("OPER root wrongpw").unwrap();
    root.expect(" 464 ");

    root.send("OPER root rootpw").unwrap();
    let lines = root.read_until("MODE");
    assert!(lines.iter().any(|l| l.contains(" 381 ")), "{lines:#?}");
    assert!(
        lines.iter().any(|l| l.contains(" 008 ") && l.contains("+cos")),
        "{lines:#?}"
    );
    assert!(lines.last().unwrap().ends_with("MODE root :+osw"));

    // Oper sees connect notices (snomask c).
    let _bob = TestClient::connect(port, "bob").unwrap();
    let notice = root.expect("Client connect: bob");
    assert!(notice.contains("NOTICE root :*** Client connect: bob"), "{notice}");
}

// ── Admission control ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_full_refuses_new_connections() {
    let mut config = test_config();
    config.limits.max_clients = 1;
    let (_server, port) = spawn_server(config).await;

    let _alice = TestClient::connect(port, "alice").unwrap();

    let mut bob = TestClient::connect_raw(port).unwrap();
    let line = bob.expect("ERROR");
    assert!(line.contains("Server full"), "{line}");
    bob.expect_eof();
}

// ── Flood control ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn excess_flood_disconnects() {
    let mut config = test_config();
    config.limits.flood_lines = 1;
    config.limits.flood_seconds = 60;
    let (_server, port) = spawn_server(config).await;

    let mut bob = TestClient::connect(port, "bob").unwrap();
    for i in 0..6 {
        let _ = bob.send(&format!("PING :{i}"));
    }
    let line = bob.expect("ERROR");
    assert!(line.contains("Excess Flood"), "{line}");
    bob.expect_eof();
}

// ── Protocol edges ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlong_line_is_rejected_but_session_survives() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut client = TestClient::connect_raw(port).unwrap();
    let long = format!("PRIVMSG #x :{}", "a".repeat(5000));
    client.send(&long).unwrap();
    let err = client.expect("ERROR");
    assert!(err.contains("Line too long"), "{err}");

    // Still connected and parsing.
    client.send("PING :alive").unwrap();
    let pong = client.expect("PONG");
    assert!(pong.ends_with(":alive"), "{pong}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_command_gets_421_and_unregistered_get_451() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut client = TestClient::connect_raw(port).unwrap();
    client.send("JOIN #room").unwrap();
    let gated = client.expect(" 451 ");
    assert!(gated.contains("You have not registered"), "{gated}");

    client.send("NICK eve").unwrap();
    client.send("USER eve 0 * :Eve").unwrap();
    client.expect(" 001 ");

    client.send("FROBNICATE now").unwrap();
    let unknown = client.expect(" 421 ");
    assert!(unknown.contains("FROBNICATE"), "{unknown}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn whois_reports_user_and_channels() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("JOIN #room").unwrap();
    bob.expect(" 366 ");

    alice.send("WHOIS bob").unwrap();
    let lines = alice.read_until(" 318 ");
    assert!(
        lines.iter().any(|l| l.contains(" 311 ") && l.contains("bob")),
        "{lines:#?}"
    );
    assert!(
        lines.iter().any(|l| l.contains(" 319 ") && l.contains("@#room")),
        "{lines:#?}"
    );

    alice.send("WHOIS nobody").unwrap();
    alice.expect(" 401 ");
    alice.expect(" 318 ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn away_user_echoes_301_to_sender() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    let mut bob = TestClient::connect(port, "bob").unwrap();

    bob.send("AWAY :out to sea").unwrap();
    bob.expect(" 306 ");

    alice.send("PRIVMSG bob :you there?").unwrap();
    let away = alice.expect(" 301 ");
    assert!(away.ends_with(":out to sea"), "{away}");
    let msg = bob.expect("PRIVMSG");
    assert!(msg.ends_with(":you there?"), "{msg}");

    bob.send("AWAY").unwrap();
    bob.expect(" 305 ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn list_hides_secret_channels() {
    let (_server, port) = spawn_server(test_config()).await;

    let mut alice = TestClient::connect(port, "alice").unwrap();
    alice.send("JOIN #open").unwrap();
    alice.expect(" 366 ");
    alice.send("JOIN #hidden").unwrap();
    alice.expect(" 366 ");
    alice.send("MODE #hidden +s").unwrap();
    alice.expect("MODE #hidden :+s");

    let mut bob = TestClient::connect(port, "bob").unwrap();
    bob.send("LIST").unwrap();
    let lines = bob.read_until(" 323 ");
    assert!(lines.iter().any(|l| l.contains("#open")), "{lines:#?}");
    assert!(!lines.iter().any(|l| l.contains("#hidden")), "{lines:#?}");

    // Members still see it.
    alice.send("LIST").unwrap();
    let lines = alice.read_until(" 323 ");
    assert!(lines.iter().any(|l| l.contains("#hidden")), "{lines:#?}");
}
