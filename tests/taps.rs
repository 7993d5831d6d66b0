use color_eyre::Result;
use common::{script, spp_device, start_server};
use pretty_assertions::assert_eq;

mod common;

fn without_timestamps(log: &str) -> Vec<String> {
    // "YYYY-MM-DD HH:MM:SS.mmm " is 24 characters.
    log.lines().map(|line| line[24..].to_owned()).collect()
}

#[tokio::test]
async fn log_round_trip() -> Result<()> {
    let server = start_server("dut test\n").await?;
    let mut client = server.connect().await?;

    assert_eq!(client.fail("log_get", "dut", "").await?, "Logging is off");

    client.ok("log_start", "dut", "").await?;
    for message in ["one", "two", "three"] {
        client.ok("ask", "dut", message).await?;
    }

    let log = client.ok("log_get", "dut", "").await?;
    assert_eq!(
        without_timestamps(&log),
        [">> one", "<< one", ">> two", "<< two", ">> three", "<< three"]
    );

    // Getting the log empties it.
    assert_eq!(client.ok("log_get", "dut", "").await?, "");

    client.ok("log_finish", "dut", "").await?;
    assert_eq!(client.fail("log_get", "dut", "").await?, "Logging is off");

    Ok(())
}

#[tokio::test]
async fn taps_see_other_connections() -> Result<()> {
    let server = start_server("dut test\n").await?;
    let mut watcher = server.connect().await?;
    let mut worker = server.connect().await?;

    watcher.ok("log_start", "dut", "").await?;
    worker.ok("ask", "dut", "hello").await?;

    let log = watcher.ok("log_get", "dut", "").await?;
    assert_eq!(without_timestamps(&log), [">> hello", "<< hello"]);

    // The worker has its own (absent) tap.
    assert_eq!(worker.fail("log_get", "dut", "").await?, "Logging is off");

    Ok(())
}

#[tokio::test]
async fn errors_are_logged() -> Result<()> {
    let prog = script(
        r#"printf '#SPP1\n#OK\n'
while read -r l; do printf '#Error: no %s\n' "$l"; done
"#,
    )?;
    let server = start_server(&spp_device("dut", &prog)).await?;
    let mut client = server.connect().await?;

    client.ok("log_start", "dut", "").await?;
    assert_eq!(client.fail("ask", "dut", "x").await?, "no x");

    let log = client.ok("log_get", "dut", "").await?;
    assert_eq!(without_timestamps(&log), [">> x", "EE no x"]);

    Ok(())
}
