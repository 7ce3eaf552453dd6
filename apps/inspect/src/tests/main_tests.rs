use super::*;
use shared::domain::display_path;

#[test]
fn root_paths_start_with_an_empty_key() {
    let path = parse_path("/children/2/props/onPress");
    assert_eq!(
        path,
        vec![
            PathSegment::from(""),
            PathSegment::from("children"),
            PathSegment::Index(2),
            PathSegment::from("props"),
            PathSegment::from("onPress"),
        ]
    );
    assert_eq!(display_path(&path), "/children/2/props/onPress");
}

#[test]
fn fire_arguments_parse() {
    let cli = Cli::try_parse_from([
        "inspect",
        "--server-url",
        "http://localhost:9000",
        "fire",
        "counter",
        "--payload",
        "{\"by\":2}",
        "--timeout-ms",
        "0",
    ])
    .expect("cli");
    assert_eq!(cli.server_url, "http://localhost:9000");
    match cli.command {
        Command::Fire {
            path,
            payload,
            timeout_ms,
        } => {
            assert_eq!(path, "counter");
            assert_eq!(payload.as_deref(), Some("{\"by\":2}"));
            assert_eq!(timeout_ms, 0);
        }
        other => panic!("expected fire, got {other:?}"),
    }
}

#[test]
fn watch_defaults_to_the_root_model() {
    let cli = Cli::try_parse_from(["inspect", "watch"]).expect("cli");
    match cli.command {
        Command::Watch { key, once } => {
            assert_eq!(key, "");
            assert!(!once);
        }
        other => panic!("expected watch, got {other:?}"),
    }
}
