use bytes::Bytes;
use http::{request, Version};
use tick_transports::{Engine, Options};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // ALPN offers h2 and http/1.1; the server picks.
    let mut engine = Engine::with_options(Options::default())?;
    for _i in 0..3 {
        let req = request::Builder::new()
            .uri("https://httpbin.org/get")
            .body(Bytes::new())?;
        let resp = engine.perform([req])?.remove(0)?;
        assert_eq!(200, resp.status());
        assert_eq!(resp.version(), Version::HTTP_2);
        println!("resp header: {:?}", resp.headers());
    }

    // http/1.1 only.
    let options = Options {
        http2: false,
        ..Options::default()
    };
    let mut engine = Engine::with_options(options)?;
    let req = request::Builder::new()
        .uri("https://httpbin.org/get")
        .body(Bytes::new())?;
    let outcome = engine.perform([req])?.remove(0);
    match outcome {
        Ok(resp) => {
            assert_eq!(resp.version(), Version::HTTP_11);
            println!("body: {}", String::from_utf8_lossy(resp.body()));
        }
        Err(e) => println!("request failed: {e:?}"),
    }
    engine.close(None)?;
    Ok(())
}
