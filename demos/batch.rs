use std::time::Duration;

use bytes::Bytes;
use http::request;
use tick_transports::{Event, EventKind, Engine, Options};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut options = Options::default();
    options.timeouts.request = Some(Duration::from_secs(10));
    options.max_connections_per_origin = 2;
    let mut engine = Engine::with_options(options)?;
    engine.on(EventKind::AltSvc, |event| {
        if let Event::AltSvc(entry) = event {
            println!("{} advertised {} over {}", entry.origin, entry.alternative, entry.protocol);
        }
    });
    engine.on(EventKind::Close, |event| println!("{event:?}"));

    let uris = [
        "https://httpbin.org/get",
        "https://httpbin.org/delay/1",
        "http://httpbin.org/status/404",
        "https://www.google.com/",
    ];
    let reqs = uris
        .iter()
        .map(|uri| request::Builder::new().uri(*uri).body(Bytes::new()))
        .collect::<Result<Vec<_>, _>>()?;

    // outcomes line up with `uris`, whatever order the servers answer in
    for (uri, outcome) in uris.iter().zip(engine.perform(reqs)?) {
        match outcome {
            Ok(resp) => println!("{uri}: {} ({} bytes)", resp.status(), resp.body().len()),
            Err(e) => println!("{uri}: {e}"),
        }
    }
    engine.close(None)?;
    Ok(())
}
