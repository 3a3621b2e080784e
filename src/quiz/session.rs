use crate::quiz::loader::LoadOutcome;
use crate::quiz::{Answer, Question, QuestionStatus, DEFAULT_REMAINING_SECONDS};

/// State of one test attempt, as the test-taking view sees it.
///
/// Until a load outcome is applied the session is `loading` with no questions
/// and a 3 hour timer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TestSession {
    questions: Vec<Question>,
    loading: bool,
    user_answers: Vec<Option<Answer>>,
    time_spent: Vec<u32>,
    question_status: Vec<QuestionStatus>,
    remaining_time: u64,
    error: Option<String>,
    test_type: Option<String>,
}

impl Default for TestSession {
    fn default() -> Self {
        Self {
            questions: Vec::new(),
            loading: true,
            user_answers: Vec::new(),
            time_spent: Vec::new(),
            question_status: Vec::new(),
            remaining_time: DEFAULT_REMAINING_SECONDS,
            error: None,
            test_type: None,
        }
    }
}

impl TestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, outcome: &LoadOutcome) {
        match outcome {
            LoadOutcome::Loaded(params) => {
                let count = params.questions.len();
                self.questions = params.questions.clone();
                self.remaining_time = u64::from(params.duration) * 60;
                self.user_answers = vec![None; count];
                self.time_spent = vec![0; count];
                self.question_status = vec![QuestionStatus::NotVisited; count];
                self.test_type = Some(params.test_type.clone());
                self.error = None;
            }
            LoadOutcome::Failed(err) => {
                self.error = Some(err.to_string());
            }
        }
        self.loading = false;
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn user_answers(&self) -> &[Option<Answer>] {
        &self.user_answers
    }

    pub fn set_user_answers(&mut self, user_answers: Vec<Option<Answer>>) {
        self.user_answers = user_answers;
    }

    pub fn time_spent(&self) -> &[u32] {
        &self.time_spent
    }

    pub fn set_time_spent(&mut self, time_spent: Vec<u32>) {
        self.time_spent = time_spent;
    }

    pub fn question_status(&self) -> &[QuestionStatus] {
        &self.question_status
    }

    pub fn set_question_status(&mut self, question_status: Vec<QuestionStatus>) {
        self.question_status = question_status;
    }

    /// Seconds
    pub fn remaining_time(&self) -> u64 {
        self.remaining_time
    }

    pub fn set_remaining_time(&mut self, remaining_time: u64) {
        self.remaining_time = remaining_time;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn test_type(&self) -> Option<&str> {
        self.test_type.as_deref()
    }

    /// Books `seconds` against question `index` and the countdown.
    pub fn spend(&mut self, index: usize, seconds: u32) {
        let mut time_spent = self.time_spent.clone();
        if let Some(spent) = time_spent.get_mut(index) {
            *spent = spent.saturating_add(seconds);
        }
        self.set_time_spent(time_spent);
        self.set_remaining_time(self.remaining_time.saturating_sub(u64::from(seconds)));
    }

    pub fn time_is_up(&self) -> bool {
        !self.loading && self.remaining_time == 0
    }

    pub fn count_with_status(&self, status: QuestionStatus) -> usize {
        self.question_status.iter().filter(|s| **s == status).count()
    }
}
