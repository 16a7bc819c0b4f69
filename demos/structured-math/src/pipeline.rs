use serde::Deserialize;
use serde_json::json;
use griddle::protocol::GENERATED_TEXT;
use griddle::{
    ChatMessage, ChatRequest, EngineError, GuidedDecoding, OutputSchema, Row,
    SamplingParams, SchemaBuilder, SchemaDefinitionError, StageError, StructuredOutput,
};

pub const SYSTEM_PROMPT: &str = "You are a math teacher. Give the answer to the equation and explain it. \
    Output the problem, answer and explanation in JSON";

/// The record the model is constrained to produce.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnswerWithExplain {
    pub problem: String,
    pub answer: i64,
    pub explain: String,
}

impl StructuredOutput for AnswerWithExplain {
    fn output_schema() -> Result<OutputSchema, SchemaDefinitionError> {
        SchemaBuilder::from_declarations("AnswerWithExplain", &[
            ("problem", "str"),
            ("answer", "int"),
            ("explain", "str"),
        ])
    }
}

pub fn problem(id: i64) -> String {
    format!("3 * {id} + 5 = ?")
}

/// Turns `{id}` into a guided chat request for the equation `3 * id + 5`.
pub fn preprocess(schema: OutputSchema) -> impl Fn(Row) -> Result<Row, StageError> + Send + Sync + 'static {
    let guided = GuidedDecoding::json(&schema);
    move |row: Row| {
        let id = row.get_i64("id")?;
        let sampling_params = SamplingParams {
            temperature: 0.3,
            max_tokens: Some(150),
            detokenize: false,
            guided_decoding: Some(guided.clone()),
            ..Default::default()
        };
        let request = ChatRequest::new(
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(problem(id))],
            sampling_params,
        );
        request.into_row()
    }
}

/// Keeps only the generated text, as `resp`.
pub fn postprocess(row: Row) -> Result<Row, StageError> {
    Ok(Row::new().with("resp", row.get_str(GENERATED_TEXT)?))
}

/// Offline stand-in for the model: solves `a * b + c = ?` exactly.
pub fn solve(request: &ChatRequest) -> Result<String, EngineError> {
    let problem = request.last_user_message().unwrap_or_default();
    let numbers: Vec<i64> = problem
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|n| n.parse().ok())
        .collect();
    let [a, b, c] = numbers[..] else {
        return Err(EngineError::MalformedGeneration(format!("not an `a * b + c` equation: {problem}")));
    };

    let product = a * b;
    Ok(json!({
        "problem": problem,
        "answer": product + c,
        "explain": format!("First multiply {a} by {b} to get {product}, then add {c}."),
    })
    .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use griddle::protocol::{MESSAGES, SAMPLING_PARAMS};

    fn schema() -> OutputSchema {
        AnswerWithExplain::output_schema().unwrap()
    }

    #[test]
    fn test_schema_has_three_required_fields() {
        let descriptor = schema().descriptor();
        assert_eq!(descriptor["required"], json!(["problem", "answer", "explain"]));
        assert_eq!(descriptor["properties"]["answer"]["type"], "integer");
    }

    #[test]
    fn test_preprocess_builds_guided_request() {
        let row = preprocess(schema())(Row::new().with("id", 6)).unwrap();
        assert!(row.contains(MESSAGES) && row.contains(SAMPLING_PARAMS));

        let request = ChatRequest::from_row(&row).unwrap();
        assert_eq!(request.messages[0], ChatMessage::system(SYSTEM_PROMPT));
        assert!(request.last_user_message().unwrap().contains("3 * 6 + 5 = ?"));
        assert_eq!(request.sampling_params.max_tokens, Some(150));
        assert!(!request.sampling_params.detokenize);
        assert_eq!(request.sampling_params.guided_decoding, Some(GuidedDecoding::json(&schema())));
    }

    #[test]
    fn test_preprocess_requires_id() {
        let err = preprocess(schema())(Row::new()).unwrap_err();
        assert_eq!(err, StageError::MissingField("id".into()));
    }

    #[test]
    fn test_postprocess_projects_generated_text() {
        let row = Row::new().with(GENERATED_TEXT, "{}").with("id", 1);
        assert_eq!(postprocess(row).unwrap(), Row::new().with("resp", "{}"));

        assert_eq!(
            postprocess(Row::new()).unwrap_err(),
            StageError::MissingField(GENERATED_TEXT.into())
        );
    }

    #[test]
    fn test_solver_answers_in_schema() {
        let request = ChatRequest::from_row(&preprocess(schema())(Row::new().with("id", 6)).unwrap()).unwrap();

        let answer = AnswerWithExplain::from_generated(&solve(&request).unwrap()).unwrap();

        assert_eq!(answer.problem, "3 * 6 + 5 = ?");
        assert_eq!(answer.answer, 23);
    }

    #[test]
    fn test_solver_rejects_other_prompts() {
        let request = ChatRequest::new(vec![ChatMessage::user("hello")], SamplingParams::default());
        assert!(matches!(solve(&request), Err(EngineError::MalformedGeneration(_))));
    }
}
