use color_eyre::Result;
use common::{start_server, wait_for_info};
use pretty_assertions::assert_eq;

mod common;

#[tokio::test]
async fn locked_device_refuses_others() -> Result<()> {
    let server = start_server("dut test\n").await?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;

    alice.ok("lock", "dut", "").await?;

    assert_eq!(bob.fail("use", "dut", "").await?, "device is locked");
    assert_eq!(bob.fail("ask", "dut", "x").await?, "device is locked");
    assert_eq!(bob.fail("lock", "dut", "").await?, "device is locked");
    assert_eq!(
        bob.fail("unlock", "dut", "").await?,
        "device is locked by another connection"
    );

    assert_eq!(alice.ok("ask", "dut", "mine").await?, "mine");

    alice.ok("unlock", "dut", "").await?;
    assert_eq!(bob.ok("ask", "dut", "x").await?, "x");

    Ok(())
}

#[tokio::test]
async fn shared_device_can_not_be_locked() -> Result<()> {
    let server = start_server("dut test\n").await?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;

    alice.ok("use", "dut", "").await?;
    bob.ok("use", "dut", "").await?;

    assert_eq!(
        alice.fail("lock", "dut", "").await?,
        "Can't lock the device: it is in use"
    );

    bob.ok("release", "dut", "").await?;
    alice.ok("lock", "dut", "").await?;

    Ok(())
}

#[tokio::test]
async fn unlocking_an_unlocked_device() -> Result<()> {
    let server = start_server("dut test\n").await?;
    let mut client = server.connect().await?;

    assert_eq!(client.fail("unlock", "dut", "").await?, "device is not locked");

    Ok(())
}

#[tokio::test]
async fn disconnecting_releases_everything() -> Result<()> {
    let server = start_server("a test\nb test\n").await?;
    let mut alice = server.connect().await?;
    let mut bob = server.connect().await?;

    alice.ok("lock", "a", "").await?;
    alice.ok("use", "b", "").await?;
    bob.ok("use", "b", "").await?;

    drop(alice);

    wait_for_info(&mut bob, "a", "Device is closed").await?;
    wait_for_info(&mut bob, "b", "Number of users: 1").await?;

    bob.ok("lock", "a", "").await?;
    bob.ok("lock", "b", "").await?;

    Ok(())
}

#[tokio::test]
async fn release_all() -> Result<()> {
    let server = start_server("a test\nb test\n").await?;
    let mut client = server.connect().await?;

    client.ok("use", "a", "").await?;
    client.ok("lock", "b", "").await?;
    client.ok("release_all", "", "").await?;

    let info = client.ok("info", "a", "").await?;
    assert!(info.contains("Device is closed"), "{info}");
    let info = client.ok("info", "b", "").await?;
    assert!(info.contains("Device is closed"), "{info}");
    assert!(!info.contains("locked"), "{info}");

    Ok(())
}
