use crate::assistant::models::ResultTable;
use serde::{Deserialize, Serialize};

/// User-toggleable flags controlling which result sections are rendered.
/// They never gate generation, only what the client displays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPrefs {
    pub show_sql: bool,
    pub show_table: bool,
    pub show_chart_code: bool,
    pub show_chart: bool,
    pub show_summary: bool,
    pub show_followups: bool,
}

impl Default for DisplayPrefs {
    fn default() -> Self {
        Self {
            show_sql: true,
            show_table: true,
            show_chart_code: false,
            show_chart: true,
            show_summary: true,
            show_followups: true,
        }
    }
}

/// Conversation state surviving across interactions: the current question,
/// the last result set, and the display preferences.
#[derive(Debug, Default)]
pub struct SessionState {
    question: Option<String>,
    table: Option<ResultTable>,
    prefs: DisplayPrefs,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    /// Setting the question is what triggers the pipeline; every entry
    /// point (typed input, suggestion, follow-up, voice) goes through here.
    pub fn set_question(&mut self, question: impl Into<String>) {
        self.question = Some(question.into());
    }

    pub fn table(&self) -> Option<&ResultTable> {
        self.table.as_ref()
    }

    pub fn set_table(&mut self, table: ResultTable) {
        self.table = Some(table);
    }

    pub fn clear_table(&mut self) {
        self.table = None;
    }

    pub fn prefs(&self) -> DisplayPrefs {
        self.prefs
    }

    pub fn set_prefs(&mut self, prefs: DisplayPrefs) {
        self.prefs = prefs;
    }

    /// Clears the question without touching display preferences.
    pub fn reset(&mut self) {
        self.question = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefs_default_to_shown_except_chart_code() {
        let prefs = DisplayPrefs::default();
        assert!(prefs.show_sql);
        assert!(prefs.show_table);
        assert!(prefs.show_chart);
        assert!(prefs.show_summary);
        assert!(prefs.show_followups);
        assert!(!prefs.show_chart_code);
    }

    #[test]
    fn reset_clears_question_but_keeps_prefs() {
        let mut session = SessionState::new();
        let mut prefs = DisplayPrefs::default();
        prefs.show_table = false;
        session.set_prefs(prefs);
        session.set_question("How many invoices are there?");

        session.reset();

        assert!(session.question().is_none());
        assert_eq!(session.prefs(), prefs);
    }

    #[test]
    fn table_can_be_cleared() {
        let mut session = SessionState::new();
        session.set_table(ResultTable::new(
            vec!["n".to_string()],
            vec![vec![json!(1)]],
        ));
        assert!(session.table().is_some());
        session.clear_table();
        assert!(session.table().is_none());
    }

    #[test]
    fn partial_prefs_payload_falls_back_to_defaults() {
        let prefs: DisplayPrefs = serde_json::from_str(r#"{"show_sql": false}"#).unwrap();
        assert!(!prefs.show_sql);
        assert!(prefs.show_table);
        assert!(!prefs.show_chart_code);
    }
}
