use clap::Parser;
use tempfile::TempDir;
use trustfs_keytool::Cli;

async fn run(args: &[&str]) -> anyhow::Result<String> {
    let cli = Cli::try_parse_from(std::iter::once("trustfs-keytool").chain(args.iter().copied()))?;
    let mut out = Vec::new();
    cli.run(&mut out).await?;
    Ok(String::from_utf8(out)?)
}

#[tokio::test]
async fn genkey_mint_show_and_verify() {
    let dir = TempDir::new().unwrap();
    let key = dir.path().join("cldb.key");
    let tickets = dir.path().join("tickets");
    let key_s = key.to_str().unwrap();
    let tickets_s = tickets.to_str().unwrap();

    let msg = run(&["genkey", "-t", "cldb", "--out", key_s]).await.unwrap();
    assert!(msg.contains("wrote cldb key"));

    run(&[
        "gen-ticket", "prod", "--user", "alice", "--uid", "1001", "--gids", "1001,4",
        "--key-file", key_s, "--out", tickets_s,
    ])
    .await
    .unwrap();
    run(&["gen-ticket", "dev", "--user", "bob", "--uid", "7", "--key-file", key_s, "--out", tickets_s])
        .await
        .unwrap();

    let text = run(&["show", "--ticket-file", tickets_s]).await.unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("prod user=alice uid=1001 gids=[1001, 4]"));
    assert!(lines[1].contains("gids=[7]"));
    assert!(lines.iter().all(|l| l.ends_with("usable=true")));

    let json: serde_json::Value =
        serde_json::from_str(&run(&["show", "--ticket-file", tickets_s, "--json"]).await.unwrap()).unwrap();
    assert_eq!(json[1]["cluster"], "dev");
    assert_eq!(json[1]["uid"], 7);

    let verified = run(&["verify", "--ticket-file", tickets_s, "--key-file", key_s]).await.unwrap();
    assert!(verified.contains("prod: ok uid=1001"));
    assert!(verified.contains("dev: ok uid=7"));
}

#[tokio::test]
async fn verify_with_other_key_fails() {
    let dir = TempDir::new().unwrap();
    let good = dir.path().join("good.key");
    let other = dir.path().join("other.key");
    let tickets = dir.path().join("tickets");

    run(&["genkey", "--out", good.to_str().unwrap()]).await.unwrap();
    run(&["genkey", "--out", other.to_str().unwrap()]).await.unwrap();
    run(&[
        "gen-ticket", "prod", "--user", "alice", "--uid", "1",
        "--key-file", good.to_str().unwrap(), "--out", tickets.to_str().unwrap(),
    ])
    .await
    .unwrap();

    let err = run(&[
        "verify", "--ticket-file", tickets.to_str().unwrap(), "--key-file", other.to_str().unwrap(),
    ])
    .await
    .unwrap_err();
    assert!(err.to_string().contains("1 ticket(s) failed validation"));
}

#[tokio::test]
async fn missing_key_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let res = run(&[
        "gen-ticket", "prod", "--user", "alice", "--uid", "1",
        "--key-file", dir.path().join("absent.key").to_str().unwrap(),
        "--out", dir.path().join("t").to_str().unwrap(),
    ])
    .await;
    assert!(res.is_err());
    assert!(!dir.path().join("t").exists());
}

#[test]
fn unknown_key_type_is_a_parse_error() {
    assert!(Cli::try_parse_from(["trustfs-keytool", "genkey", "-t", "bogus"]).is_err());
}
