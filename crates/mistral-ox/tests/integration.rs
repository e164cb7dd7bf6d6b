//! Live API tests. Run with `MISTRAL_API_KEY` set and `--ignored`.

use futures_util::StreamExt;
use mistral_ox::{
    ChatRequest, EmbeddingsRequest, Mistral, ModerationRequest, Model,
    batch::{BatchCoordinator, BatchOptions},
    message::{Message, Messages},
    tool::{Tool, ToolChoice, ToolChoiceMode},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn get_test_client() -> Result<Mistral, Box<dyn std::error::Error>> {
    Mistral::load_from_env().map_err(|e| {
        format!("Failed to load Mistral API key: {e}. Set MISTRAL_API_KEY environment variable.")
            .into()
    })
}

#[tokio::test]
#[ignore = "requires MISTRAL_API_KEY"]
async fn test_basic_chat() -> Result<(), Box<dyn std::error::Error>> {
    let client = get_test_client()?;

    let request = ChatRequest::builder()
        .model(Model::MistralSmallLatest.to_string())
        .messages(Messages::new([Message::user(
            "What is 2+2? Reply with just the number.",
        )]))
        .max_tokens(10)
        .build();

    let response = client.send(&request).await?;

    assert!(!response.id.is_empty());
    assert!(!response.choices.is_empty());
    assert!(response.content().unwrap_or_default().contains('4'));
    if let Some(usage) = response.usage {
        assert!(usage.prompt_tokens > 0);
        assert!(usage.total_tokens >= usage.prompt_tokens);
    }
    Ok(())
}

#[tokio::test]
#[ignore = "requires MISTRAL_API_KEY"]
async fn test_streaming_chat() -> Result<(), Box<dyn std::error::Error>> {
    let client = get_test_client()?;

    let request = ChatRequest::builder()
        .model(Model::MistralSmallLatest.to_string())
        .user_message("Count from 1 to 5, separated by spaces.")
        .max_tokens(30)
        .build();

    let mut stream = client.stream(&request);
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        if let Some(delta) = chunk?.delta_text() {
            text.push_str(delta);
        }
    }

    assert!(text.contains('3'), "unexpected stream output: {text}");
    Ok(())
}

#[tokio::test]
#[ignore = "requires MISTRAL_API_KEY"]
async fn test_tool_calling() -> Result<(), Box<dyn std::error::Error>> {
    let client = get_test_client()?;

    let weather = Tool::function("get_weather", "Get the current weather for a city")
        .with_parameters(json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        }));
    let request = ChatRequest::builder()
        .model(Model::MistralLargeLatest.to_string())
        .user_message("What's the weather in Paris?")
        .tools(vec![weather])
        .tool_choice(ToolChoice::from(ToolChoiceMode::Any))
        .build();

    let response = client.send(&request).await?;
    let calls = response.choices[0]
        .message
        .tool_calls
        .clone()
        .unwrap_or_default();

    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "get_weather");
    let args: serde_json::Value = calls[0].function.parse_arguments()?;
    assert!(args["city"].as_str().is_some_and(|c| c.contains("Paris")));
    Ok(())
}

#[tokio::test]
#[ignore = "requires MISTRAL_API_KEY"]
async fn test_embeddings_and_moderation() -> Result<(), Box<dyn std::error::Error>> {
    let client = get_test_client()?;

    let embeddings = client
        .embeddings(
            &EmbeddingsRequest::builder()
                .model(Model::MistralEmbed.to_string())
                .input(vec!["first".to_string(), "second".to_string()])
                .build(),
        )
        .await?;
    let vectors = embeddings.into_vectors();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0].len(), vectors[1].len());

    let moderation = client
        .moderate(
            &ModerationRequest::builder()
                .model(Model::MistralModerationLatest.to_string())
                .input("Have a lovely day")
                .build(),
        )
        .await?;
    assert_eq!(moderation.results.len(), 1);
    assert!(!moderation.results[0].flagged());
    Ok(())
}

#[tokio::test]
#[ignore = "requires MISTRAL_API_KEY"]
async fn test_list_models() -> Result<(), Box<dyn std::error::Error>> {
    let client = get_test_client()?;

    let models = client.list_models().await?;
    assert!(models.data.iter().any(|m| m.id == "mistral-embed"));
    Ok(())
}

#[tokio::test]
#[ignore = "requires MISTRAL_API_KEY"]
async fn test_batch_coordinator_embeddings() -> Result<(), Box<dyn std::error::Error>> {
    let client = get_test_client()?;
    let coordinator = BatchCoordinator::new(client.embeddings_invoker());

    let texts: Vec<String> = (0..20).map(|i| format!("sentence number {i}")).collect();
    let options = BatchOptions::builder()
        .chunk_size(8)
        .max_concurrency(2)
        .build();
    let job = coordinator
        .submit(texts, Model::MistralEmbed.to_string(), options)
        .await?;
    let result = coordinator
        .wait_for_completion(job, &CancellationToken::new())
        .await?;

    assert_eq!(result.summary.total_requests, 20);
    assert_eq!(result.summary.succeeded, 20);
    Ok(())
}
