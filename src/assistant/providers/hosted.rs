use crate::assistant::models::ResultTable;
use crate::assistant::{AssistantError, ModelService};
use crate::config::AssistantConfig;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Rows of a result handed to the service inside a prompt. Anything larger
/// adds cost without changing the answer.
const PREVIEW_ROWS: usize = 10;

pub struct HostedModelService {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    fence_re: Regex,
}

#[derive(Serialize)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl HostedModelService {
    pub fn new(config: &AssistantConfig) -> Result<Self, AssistantError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            AssistantError::ConfigError("API URL is required for the hosted backend".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            AssistantError::ConfigError("API key is required for the hosted backend".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AssistantError::ConnectionError(e.to_string()))?;

        let fence_re = Regex::new(r"(?s)```(?:[a-zA-Z]*\n)?(.*?)```")
            .map_err(|e| AssistantError::ConfigError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            fence_re,
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, AssistantError> {
        let request = PromptRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt,
            }],
            temperature: 0.1,
            max_tokens: 2000,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AssistantError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };
            error!("Model service responded with status code: {}{}", status, error_body);
            return Err(AssistantError::ResponseError(format!(
                "API responded with status code: {}",
                status
            )));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| AssistantError::ResponseError(e.to_string()))?;

        if prompt_response.choices.is_empty() {
            return Err(AssistantError::ResponseError(
                "No choices in response".to_string(),
            ));
        }

        let content = prompt_response.choices[0].message.content.clone();
        debug!("Model service content: {}", content);
        Ok(content)
    }

    /// Pulls the body of the first code fence, or returns the whole
    /// response trimmed when the service skipped the fence.
    fn extract_fenced(&self, content: &str) -> String {
        if let Some(captures) = self.fence_re.captures(content) {
            if let Some(body) = captures.get(1) {
                return body.as_str().trim().to_string();
            }
        }
        content.trim().to_string()
    }
}

fn sql_prompt(question: &str, schema: &str) -> String {
    format!(
        r#"
### Instructions:
Your task is to convert a question into a SQLite query, given a database schema.
Adhere to these rules:
- **Deliberately go through the question and database schema word by word** to appropriately answer the question
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT table1.col1, table2.col1 FROM table1 JOIN table2 ON table1.id = table2.id`.
- When creating a ratio, always cast the numerator as float
- If the question cannot be answered from this schema, respond with an empty code block

### Input:
Generate a SQL query that answers the question `{}`.
This query will run on a SQLite database whose schema is represented in this string:
{}

### Response:
```sql
"#,
        question, schema
    )
}

fn questions_prompt(schema: &str) -> String {
    format!(
        r#"Given the following SQLite database schema, suggest questions a user could ask about the data.
Return one question per line with no numbering or commentary.

{}
"#,
        schema
    )
}

fn validity_prompt(sql: &str) -> String {
    format!(
        r#"Is the following a valid SQLite SELECT statement that could run without error?
Answer with a single word, yes or no.

{}
"#,
        sql
    )
}

fn chart_decision_prompt(question: &str, sql: &str, table: &ResultTable) -> String {
    format!(
        r#"A user asked `{}`, which produced the SQL below and the result sample below.
Would a chart be an appropriate way to present this result? Answer with a single word, yes or no.

SQL:
{}

Result sample:
{}
"#,
        question,
        sql,
        table.preview(PREVIEW_ROWS)
    )
}

fn chart_code_prompt(question: &str, sql: &str, table: &ResultTable) -> String {
    format!(
        r#"A user asked `{}`, which produced the SQL below and the result sample below.
Write Plotly chart code that visualizes this result. Respond with only the code in a code block.
If no sensible chart exists, respond with an empty code block.

SQL:
{}

Result sample:
{}
"#,
        question,
        sql,
        table.preview(PREVIEW_ROWS)
    )
}

fn render_prompt(code: &str, table: &ResultTable) -> String {
    format!(
        r#"Combine the Plotly chart code below with the result data below into a complete Plotly
figure object. Respond with only the figure JSON (an object with `data` and `layout` keys)
in a code block.

Chart code:
{}

Result data:
{}
"#,
        code,
        table.preview(PREVIEW_ROWS)
    )
}

fn followup_prompt(question: &str, sql: &str, table: &ResultTable) -> String {
    format!(
        r#"A user asked `{}`, which produced the SQL below and the result sample below.
Suggest follow-up questions the user might ask next about the same data.
Return one question per line with no numbering or commentary.

SQL:
{}

Result sample:
{}
"#,
        question,
        sql,
        table.preview(PREVIEW_ROWS)
    )
}

fn summary_prompt(question: &str, table: &ResultTable) -> String {
    format!(
        r#"A user asked `{}` and received the result below.
Summarize the result in a short paragraph of plain text. Do not use markdown.

Result sample:
{}
"#,
        question,
        table.preview(PREVIEW_ROWS)
    )
}

/// Interprets a yes/no style judgement from the service.
fn parse_yes_no(content: &str) -> bool {
    let normalized = content.trim().to_lowercase();
    normalized.starts_with("yes") || normalized.starts_with("true")
}

/// One item per line, tolerating bullet markers and numbering.
fn parse_question_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == '-' || c == '*')
                .trim()
        })
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

#[async_trait]
impl ModelService for HostedModelService {
    async fn generate_questions(&self, schema: &str) -> Result<Vec<String>, AssistantError> {
        let content = self.complete(questions_prompt(schema)).await?;
        Ok(parse_question_list(&content))
    }

    async fn generate_sql(&self, question: &str, schema: &str) -> Result<String, AssistantError> {
        let content = self.complete(sql_prompt(question, schema)).await?;
        // The service sometimes wraps SQL in backticks even inside a fence
        Ok(self.extract_fenced(&content).replace('`', ""))
    }

    async fn is_sql_valid(&self, sql: &str) -> Result<bool, AssistantError> {
        let content = self.complete(validity_prompt(sql)).await?;
        Ok(parse_yes_no(&content))
    }

    async fn should_generate_chart(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<bool, AssistantError> {
        let content = self
            .complete(chart_decision_prompt(question, sql, table))
            .await?;
        Ok(parse_yes_no(&content))
    }

    async fn generate_chart_code(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<String, AssistantError> {
        let content = self
            .complete(chart_code_prompt(question, sql, table))
            .await?;
        Ok(self.extract_fenced(&content))
    }

    async fn render_chart(
        &self,
        code: &str,
        table: &ResultTable,
    ) -> Result<Option<serde_json::Value>, AssistantError> {
        let content = self.complete(render_prompt(code, table)).await?;
        let body = self.extract_fenced(&content);
        if body.is_empty() {
            return Ok(None);
        }
        // A figure that does not parse is the same as no figure
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(figure) if figure.is_object() => Ok(Some(figure)),
            _ => Ok(None),
        }
    }

    async fn generate_followups(
        &self,
        question: &str,
        sql: &str,
        table: &ResultTable,
    ) -> Result<Vec<String>, AssistantError> {
        let content = self.complete(followup_prompt(question, sql, table)).await?;
        Ok(parse_question_list(&content))
    }

    async fn generate_summary(
        &self,
        question: &str,
        table: &ResultTable,
    ) -> Result<Option<String>, AssistantError> {
        let content = self.complete(summary_prompt(question, table)).await?;
        let summary = content.trim().to_string();
        if summary.is_empty() {
            Ok(None)
        } else {
            Ok(Some(summary))
        }
    }
}
