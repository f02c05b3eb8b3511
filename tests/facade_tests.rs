//! ファサード経由のOLLAMA呼び出しテスト
//!
//! wiremockでOLLAMAサーバーをモックし、TestCaseで組み立てたアプリケーションから
//! ファサードを解決して呼び出す。

use ollama_facade::testing::TestCase;
use ollama_facade::{key_of, ChatMessage, Ollama, OllamaApi};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============= Helper Functions =============

/// モックサーバーに向けたテストケースを作成
fn case_for(server: &MockServer) -> TestCase {
    TestCase::builder()
        .set("ollama.url", server.uri())
        .set("ollama.model", "llama3.2")
        .set("ollama.retry.initial_backoff_ms", "1")
        .set("ollama.retry.max_backoff_ms", "5")
        .build()
        .unwrap()
}

fn generate_body(text: &str) -> serde_json::Value {
    json!({
        "model": "llama3.2",
        "created_at": "2024-01-01T00:00:00Z",
        "response": text,
        "done": true
    })
}

/// NDJSON形式のストリーミングレスポンス
fn ndjson_chat_stream(chunks: &[&str]) -> String {
    let total = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut line = json!({
                "model": "llama3.2",
                "message": {"role": "assistant", "content": chunk},
                "done": i == total - 1
            });
            if i == total - 1 {
                line["eval_count"] = json!(4);
                line["eval_duration"] = json!(2_000_000_000u64);
            }
            format!("{}\n", line)
        })
        .collect()
}

/// 1件のリクエストを受け、`Content-Length` より短いボディを送って接続を切るサーバー
async fn truncating_server(partial_body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // リクエストを最後まで読んでから応答する
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }

        let head = "HTTP/1.1 200 OK\r\n\
                    Content-Type: application/x-ndjson\r\n\
                    Content-Length: 1000\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(partial_body.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        // ここでソケットがドロップされ、ボディの途中で切断される
    });

    format!("http://{}", addr)
}

// ============= Tests =============

#[tokio::test]
async fn test_generate_through_facade() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "llama3.2",
            "prompt": "Why is the sky blue?",
            "system": "Answer briefly",
            "stream": false
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(generate_body("Rayleigh scattering.")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let case = case_for(&server);
    let ollama = case.ollama().unwrap();

    let text = ollama
        .generate("Why is the sky blue?", Some("Answer briefly"))
        .await
        .unwrap();
    assert_eq!(text, "Rayleigh scattering.");
}

#[tokio::test]
async fn test_facade_matches_direct_resolution() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_body("same")))
        .expect(2)
        .mount(&server)
        .await;

    let case = case_for(&server);
    let via_facade = case.ollama().unwrap().generate("q", None).await.unwrap();
    let direct = case
        .app()
        .container()
        .resolve::<dyn OllamaApi>(key_of::<dyn OllamaApi>())
        .unwrap()
        .generate("q", None)
        .await
        .unwrap();

    assert_eq!(via_facade, direct);
}

#[tokio::test]
async fn test_chat_returns_assistant_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "messages": [
                {"role": "system", "content": "You are terse"},
                {"role": "user", "content": "Hello"}
            ],
            "stream": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3.2",
            "message": {"role": "assistant", "content": "Hi."},
            "done": true
        })))
        .mount(&server)
        .await;

    let case = case_for(&server);
    let reply = case
        .ollama()
        .unwrap()
        .chat(&[ChatMessage::system("You are terse"), ChatMessage::user("Hello")])
        .await
        .unwrap();

    assert_eq!(reply, ChatMessage::assistant("Hi."));
}

#[tokio::test]
async fn test_chat_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(ndjson_chat_stream(&["Hel", "lo", "!"]), "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let case = case_for(&server);
    let mut stream = case
        .ollama()
        .unwrap()
        .chat_streaming(&[ChatMessage::user("greet me")])
        .await
        .unwrap();

    let mut last = None;
    while let Some(chunk) = stream.next().await {
        last = Some(chunk.unwrap());
    }

    assert_eq!(stream.accumulated(), "Hello!");
    let last = last.unwrap();
    assert!(last.done);
    assert_eq!(last.stats.unwrap().tokens_per_second, 2.0);
}

#[tokio::test]
async fn test_list_models() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [
                {"name": "llama3.2:latest", "size": 2019393189u64, "digest": "a80c4f17acd5"},
                {"name": "mistral:7b"}
            ]
        })))
        .mount(&server)
        .await;

    let case = case_for(&server);
    let ollama = case.ollama().unwrap();
    let models = ollama.list_models().await.unwrap();

    let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["llama3.2:latest", "mistral:7b"]);
    assert!(ollama.is_available().await);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(generate_body("recovered")))
        .expect(1)
        .mount(&server)
        .await;

    let case = case_for(&server);
    let text = case.ollama().unwrap().generate("q", None).await.unwrap();
    assert_eq!(text, "recovered");
}

#[tokio::test]
async fn test_client_errors_pass_through_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"error": "model \"missing\" not found"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let case = case_for(&server);
    let err = case
        .ollama()
        .unwrap()
        .chat(&[ChatMessage::user("hi")])
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("404"), "unexpected error: {}", message);
    assert!(message.contains("not found"), "unexpected error: {}", message);
}

#[tokio::test]
async fn test_unreachable_server() {
    let case = TestCase::builder()
        .set("ollama.url", "http://127.0.0.1:9")
        .set("ollama.retry.max_retries", "0")
        .set("ollama.connect_timeout", "1")
        .build()
        .unwrap();
    let ollama: Ollama = case.ollama().unwrap();

    assert!(!ollama.is_available().await);
    assert!(ollama.list_models().await.is_err());
}

#[tokio::test]
async fn test_generate_streaming() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"model":"llama3.2","response":"Rayleigh ","done":false}"#,
        "\n",
        r#"{"model":"llama3.2","response":"scattering.","done":false}"#,
        "\n",
        r#"{"response":"","done":true,"eval_count":2,"eval_duration":1000000000}"#,
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"prompt": "Why is the sky blue?", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .expect(1)
        .mount(&server)
        .await;

    let case = case_for(&server);
    let mut stream = case
        .ollama()
        .unwrap()
        .generate_streaming("Why is the sky blue?", None)
        .await
        .unwrap();

    let mut seen = Vec::new();
    let text = stream
        .process_with_callback(|token| seen.push(token.to_string()))
        .await
        .unwrap();

    assert_eq!(text, "Rayleigh scattering.");
    assert_eq!(seen, vec!["Rayleigh ", "scattering.", ""]);
}

#[tokio::test]
async fn test_stream_error_line_is_returned() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"model":"llama3.2","message":{"role":"assistant","content":"Hel"},"done":false}"#,
        "\n",
        r#"{"error":"model crashed"}"#,
        "\n",
        r#"{"model":"llama3.2","message":{"role":"assistant","content":"lo"},"done":true}"#,
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let case = case_for(&server);
    let mut stream = case
        .ollama()
        .unwrap()
        .chat_streaming(&[ChatMessage::user("hi")])
        .await
        .unwrap();

    let err = stream.collect_all().await.unwrap_err();
    assert!(err.to_string().contains("model crashed"), "unexpected error: {}", err);
    // エラー以降の行は読まれない
    assert_eq!(stream.accumulated(), "Hel");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_final_line_without_newline_is_delivered() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"model":"llama3.2","response":"Hi","done":false}"#,
        "\n",
        r#"{"model":"llama3.2","response":"!","done":true}"#,
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let case = case_for(&server);
    let mut stream = case
        .ollama()
        .unwrap()
        .generate_streaming("greet", None)
        .await
        .unwrap();

    assert_eq!(stream.next_text().await.unwrap().unwrap(), "Hi");
    let last = stream.next().await.unwrap().unwrap();
    assert_eq!(last.text, "!");
    assert!(last.done);
    assert_eq!(stream.accumulated(), "Hi!");
}

#[tokio::test]
async fn test_final_error_line_without_newline_is_returned() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"model":"llama3.2","response":"Hi","done":false}"#,
        "\n",
        r#"{"error":"context length exceeded"}"#,
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
        .mount(&server)
        .await;

    let case = case_for(&server);
    let mut stream = case
        .ollama()
        .unwrap()
        .generate_streaming("greet", None)
        .await
        .unwrap();

    let err = stream.collect_all().await.unwrap_err();
    assert!(err.to_string().contains("context length exceeded"), "unexpected error: {}", err);
    assert_eq!(stream.accumulated(), "Hi");
}

#[tokio::test]
async fn test_transport_error_mid_stream_is_returned() {
    let url = truncating_server(concat!(
        r#"{"model":"llama3.2","response":"partial","done":false}"#,
        "\n"
    ))
    .await;
    let case = TestCase::builder()
        .set("ollama.url", url)
        .set("ollama.retry.max_retries", "0")
        .build()
        .unwrap();

    let mut stream = case
        .ollama()
        .unwrap()
        .generate_streaming("q", None)
        .await
        .unwrap();

    let err = stream.collect_all().await.unwrap_err();
    assert!(
        format!("{:#}", err).contains("切断"),
        "unexpected error: {:#}",
        err
    );
    assert_eq!(stream.accumulated(), "partial");
}
