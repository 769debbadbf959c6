//! Integration tests for the LLM client and rubric judge.
//!
//! These tests make real calls to a LiteLLM-compatible endpoint.
//! Run with: LITELLM_API_BASE=http://localhost:4000 cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use orch_bench::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
use orch_bench::scoring::{compute_rubric_score, run_rubric_judge, LlmRubricJudge};
use orch_bench::trial::RubricCriterion;

fn create_test_client() -> LiteLlmClient {
    LiteLlmClient::from_env()
        .expect("LITELLM_API_BASE environment variable must be set for integration tests")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        "",
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.first_content().expect("Should have content");
    assert!(
        content.contains('4'),
        "Response should contain '4', got: {}",
        content
    );
    assert!(response.usage.total_tokens > 0, "Should have token usage");
}

#[tokio::test]
#[ignore]
async fn test_judge_scores_relevant_diff_higher() {
    let client = Arc::new(create_test_client());
    let model = client.default_model().to_string();
    let judge = LlmRubricJudge::new(client, model);

    let rubric = vec![RubricCriterion {
        name: "correctness".to_string(),
        description: "The off-by-one error in `last_index` is fixed.".to_string(),
        weight: 1.0,
    }];
    let description = "Fix `last_index` in util.py: it returns len(items) instead of len(items) - 1.";
    let good = "--- a/util.py\n+++ b/util.py\n@@ -1,2 +1,2 @@\n def last_index(items):\n-    return len(items)\n+    return len(items) - 1\n";
    let bad = "--- a/README.md\n+++ b/README.md\n@@ -1 +1 @@\n-# util\n+# utilities\n";

    let good_scores = run_rubric_judge(&judge, &rubric, description, good).await;
    let bad_scores = run_rubric_judge(&judge, &rubric, description, bad).await;

    let good_score = compute_rubric_score(&good_scores).expect("judge should score the fix");
    let bad_score = compute_rubric_score(&bad_scores).expect("judge should score the unrelated diff");
    assert!(
        good_score > bad_score,
        "fix scored {good_score}, unrelated diff scored {bad_score}"
    );
}
