use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, warn};

use crate::quiz::store::{DocumentStore, SessionStore, SpecialTestService, StoreError};
use crate::quiz::{
    Question, TestParameters, PYQ_DURATION_MINUTES, PYQ_QUESTION_COUNT, PYQ_TEST_TYPE,
    TEST_PARAMS_KEY,
};

pub const DASHBOARD_PATH: &str = "/dashboard";
const SPECIAL_TEST_PATH_MARKER: &str = "/test/special/";

/// What the caller knows when it asks for a test.
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    pub year: Option<String>,
    pub paper_type: Option<String>,
    pub test_id: Option<String>,
    /// Path the user is currently on, used to find a special test id when none is given.
    pub current_path: Option<String>,
}

impl LoadRequest {
    pub fn previous_year(paper_type: &str, year: &str) -> Self {
        Self {
            year: Some(year.to_string()),
            paper_type: Some(paper_type.to_string()),
            ..Self::default()
        }
    }

    pub fn special(test_id: &str) -> Self {
        Self {
            test_id: Some(test_id.to_string()),
            ..Self::default()
        }
    }

    pub fn at_path(path: &str) -> Self {
        Self {
            current_path: Some(path.to_string()),
            ..Self::default()
        }
    }

    fn special_test_id(&self) -> Option<&str> {
        self.test_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or_else(|| self.current_path.as_deref().and_then(special_test_id_from_path))
    }
}

/// The segment after `/test/special/`, up to the next occurrence of the marker.
pub fn special_test_id_from_path(path: &str) -> Option<&str> {
    if !path.contains(SPECIAL_TEST_PATH_MARKER) {
        return None;
    }
    path.split(SPECIAL_TEST_PATH_MARKER)
        .nth(1)
        .filter(|id| !id.is_empty())
}

pub fn pyq_collection_name(paper_type: Option<&str>, year: &str) -> String {
    format!(
        "pyqQuestions_{}_{}",
        paper_type.unwrap_or_default().replace(' ', "_"),
        year
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Default,
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notification {
    pub fn info(title: &str, description: String) -> Self {
        Self {
            title: title.to_string(),
            description,
            severity: Severity::Default,
        }
    }

    fn destructive(title: &str, description: String) -> Self {
        Self {
            title: title.to_string(),
            description,
            severity: Severity::Destructive,
        }
    }
}

/// Why a test could not be loaded. `Display` is the text kept in the session's `error`.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("No test parameters found")]
    NoParametersFound,
    #[error("Failed to load special test. Please try again.")]
    SpecialTestLoadFailed { test_id: String },
    #[error("No questions found")]
    NoQuestionsFound { paper_type: String, year: String },
    #[error("Insufficient questions: {found}/{required}")]
    InsufficientQuestions {
        found: usize,
        required: usize,
        paper_type: String,
        year: String,
    },
    #[error("Invalid test parameters")]
    InvalidParameters,
    #[error("Failed to load test")]
    UnexpectedLoadFailure(#[from] StoreError),
}

impl LoadError {
    pub fn notification(&self) -> Notification {
        match self {
            LoadError::NoParametersFound => Notification::destructive(
                "Error",
                "No test parameters found. Returning to dashboard.".to_string(),
            ),
            LoadError::SpecialTestLoadFailed { .. } => Notification::destructive(
                "Error",
                "Failed to load special test or no questions found. Please try again.".to_string(),
            ),
            LoadError::NoQuestionsFound { paper_type, year } => Notification::destructive(
                "No questions found",
                format!(
                    "No questions found for {} {}. Please try another paper.",
                    paper_type, year
                ),
            ),
            LoadError::InsufficientQuestions {
                found,
                required,
                paper_type,
                year,
            } => Notification::destructive(
                "Insufficient questions",
                format!(
                    "Only {}/{} questions are available for {} {}. Please try another paper or contact admin.",
                    found, required, paper_type, year
                ),
            ),
            LoadError::InvalidParameters => Notification::destructive(
                "Error",
                "Invalid test parameters or no questions found. Returning to dashboard.".to_string(),
            ),
            LoadError::UnexpectedLoadFailure(_) => Notification::destructive(
                "Error",
                "Failed to load test data. Please try again.".to_string(),
            ),
        }
    }

    /// Every failed load leaves the test view.
    pub fn redirect_to(&self) -> &'static str {
        DASHBOARD_PATH
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(TestParameters),
    Failed(LoadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(u64);

/// Hands out a new generation for every load, so a load that finishes late
/// can tell that it has been superseded.
#[derive(Debug, Default)]
pub struct LoadTracker {
    current: AtomicU64,
}

impl LoadTracker {
    pub fn begin(&self) -> LoadTicket {
        LoadTicket(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: LoadTicket) -> bool {
        self.current.load(Ordering::SeqCst) == ticket.0
    }
}

pub struct TestLoader<D, G> {
    documents: D,
    special_tests: G,
}

impl<D: DocumentStore, G: SpecialTestService> TestLoader<D, G> {
    pub fn new(documents: D, special_tests: G) -> Self {
        Self {
            documents,
            special_tests,
        }
    }

    /// Resolves a test for one session. Returns `None` if another load for the
    /// same session started while this one was in flight.
    pub async fn load<S: SessionStore + Sync + ?Sized>(
        &self,
        session: &S,
        tracker: &LoadTracker,
        request: &LoadRequest,
    ) -> Option<LoadOutcome> {
        let ticket = tracker.begin();
        let outcome = self.resolve(session, request).await;
        if !tracker.is_current(ticket) {
            warn!("Discarding result of a superseded test load");
            return None;
        }
        Some(outcome)
    }

    pub async fn resolve<S: SessionStore + Sync + ?Sized>(
        &self,
        session: &S,
        request: &LoadRequest,
    ) -> LoadOutcome {
        match self.try_resolve(session, request).await {
            Ok(params) => {
                info!("Setting up test with {} questions", params.questions.len());
                LoadOutcome::Loaded(params)
            }
            Err(err) => {
                match &err {
                    LoadError::UnexpectedLoadFailure(source) => {
                        error!("Error loading test: {}", source)
                    }
                    other => error!("Could not load test: {}", other),
                }
                LoadOutcome::Failed(err)
            }
        }
    }

    async fn try_resolve<S: SessionStore + Sync + ?Sized>(
        &self,
        session: &S,
        request: &LoadRequest,
    ) -> Result<TestParameters, LoadError> {
        let special_test_id = request.special_test_id();
        debug!("Current path: {:?}", request.current_path);
        debug!("Special test id: {:?}", special_test_id);

        let params = if let Some(stored) = session.get(TEST_PARAMS_KEY) {
            // Consumed before parsing, so a broken blob is not picked up again
            session.remove(TEST_PARAMS_KEY);
            debug!("Using stored test parameters");
            serde_json::from_str::<TestParameters>(&stored).map_err(StoreError::from)?
        } else if let Some(test_id) = special_test_id {
            self.load_special_test(test_id).await?
        } else if let Some(year) = request.year.as_deref().filter(|year| !year.is_empty()) {
            self.load_previous_year_test(request.paper_type.as_deref(), year)
                .await?
        } else {
            return Err(LoadError::NoParametersFound);
        };

        if params.questions.is_empty() {
            return Err(LoadError::InvalidParameters);
        }
        Ok(params)
    }

    async fn load_special_test(&self, test_id: &str) -> Result<TestParameters, LoadError> {
        info!("Loading special test with id {}", test_id);
        match self.special_tests.generate(test_id).await? {
            Some(params) if !params.questions.is_empty() => {
                debug!("Special test {} has {} questions", test_id, params.questions.len());
                Ok(params)
            }
            _ => Err(LoadError::SpecialTestLoadFailed {
                test_id: test_id.to_string(),
            }),
        }
    }

    async fn load_previous_year_test(
        &self,
        paper_type: Option<&str>,
        year: &str,
    ) -> Result<TestParameters, LoadError> {
        info!("Loading PYQ test for year {}, paper type {:?}", year, paper_type);
        let collection = pyq_collection_name(paper_type, year);
        let documents = self.documents.query(&collection).await?;

        if documents.is_empty() {
            return Err(LoadError::NoQuestionsFound {
                paper_type: paper_type.unwrap_or_default().to_string(),
                year: year.to_string(),
            });
        }
        if documents.len() < PYQ_QUESTION_COUNT {
            return Err(LoadError::InsufficientQuestions {
                found: documents.len(),
                required: PYQ_QUESTION_COUNT,
                paper_type: paper_type.unwrap_or_default().to_string(),
                year: year.to_string(),
            });
        }

        let questions = documents
            .into_iter()
            .take(PYQ_QUESTION_COUNT)
            .map(Question::from_document)
            .collect();
        Ok(TestParameters::new(
            questions,
            PYQ_DURATION_MINUTES,
            PYQ_TEST_TYPE.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Map};

    use super::*;
    use crate::quiz::store::{Document, MemorySessionStore};

    #[derive(Default)]
    struct FakeDocuments {
        documents: Vec<Document>,
        fail: bool,
        queried: Mutex<Vec<String>>,
    }

    impl FakeDocuments {
        fn with_count(count: usize) -> Self {
            let documents = (0..count)
                .map(|i| {
                    let fields = json!({ "text": format!("question {}", i) });
                    Document::new(format!("doc{:03}", i), fields.as_object().cloned().unwrap())
                })
                .collect();
            Self {
                documents,
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn queried(&self) -> Vec<String> {
            self.queried.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentStore for FakeDocuments {
        async fn query(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
            self.queried.lock().unwrap().push(collection.to_string());
            if self.fail {
                return Err(StoreError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(self.documents.clone())
        }
    }

    enum FakeSpecialTests {
        Returns(Option<TestParameters>),
        Fails,
        /// Starts another load on the tracker while this one is in flight.
        Superseded(Arc<LoadTracker>),
    }

    #[async_trait]
    impl SpecialTestService for FakeSpecialTests {
        async fn generate(&self, _test_id: &str) -> Result<Option<TestParameters>, StoreError> {
            match self {
                FakeSpecialTests::Returns(params) => Ok(params.clone()),
                FakeSpecialTests::Fails => Err(StoreError::Malformed("boom".to_string())),
                FakeSpecialTests::Superseded(tracker) => {
                    tracker.begin();
                    Ok(Some(params(1, 5)))
                }
            }
        }
    }

    fn params(count: usize, duration: u32) -> TestParameters {
        let questions = (0..count)
            .map(|i| Question::new(format!("q{}", i), Map::new()))
            .collect();
        TestParameters::new(questions, duration, "custom".to_string())
    }

    fn loader(
        documents: FakeDocuments,
        special: FakeSpecialTests,
    ) -> TestLoader<FakeDocuments, FakeSpecialTests> {
        TestLoader::new(documents, special)
    }

    fn no_special() -> FakeSpecialTests {
        FakeSpecialTests::Returns(None)
    }

    #[test]
    fn extracts_special_test_id_from_path() {
        assert_eq!(special_test_id_from_path("/test/special/abc123"), Some("abc123"));
        assert_eq!(
            special_test_id_from_path("/app/test/special/x/test/special/y"),
            Some("x")
        );
        assert_eq!(special_test_id_from_path("/test/special/"), None);
        assert_eq!(special_test_id_from_path("/dashboard"), None);
    }

    #[test]
    fn collection_name_uses_underscores() {
        assert_eq!(
            pyq_collection_name(Some("Paper 1"), "2020"),
            "pyqQuestions_Paper_1_2020"
        );
        assert_eq!(pyq_collection_name(None, "2019"), "pyqQuestions__2019");
    }

    #[tokio::test]
    async fn stored_parameters_are_used_once() {
        let session = MemorySessionStore::new();
        let stored = params(3, 45);
        session.set(TEST_PARAMS_KEY, serde_json::to_string(&stored).unwrap());
        let loader = loader(FakeDocuments::default(), no_special());

        let first = loader.resolve(&session, &LoadRequest::default()).await;
        let second = loader.resolve(&session, &LoadRequest::default()).await;

        match first {
            LoadOutcome::Loaded(loaded) => assert_eq!(loaded, stored),
            other => panic!("expected stored test, got {:?}", other),
        }
        assert!(session.get(TEST_PARAMS_KEY).is_none());
        assert!(matches!(
            second,
            LoadOutcome::Failed(LoadError::NoParametersFound)
        ));
    }

    #[tokio::test]
    async fn stored_parameters_win_over_other_sources() {
        let session = MemorySessionStore::new();
        session.set(TEST_PARAMS_KEY, serde_json::to_string(&params(2, 10)).unwrap());
        let documents = FakeDocuments::with_count(70);
        let loader = loader(documents, FakeSpecialTests::Fails);
        let request = LoadRequest {
            year: Some("2020".to_string()),
            paper_type: Some("Paper 1".to_string()),
            test_id: Some("special".to_string()),
            current_path: None,
        };

        let outcome = loader.resolve(&session, &request).await;

        assert!(matches!(outcome, LoadOutcome::Loaded(ref p) if p.questions.len() == 2));
        assert!(loader.documents.queried().is_empty());
    }

    #[tokio::test]
    async fn stored_parameters_without_questions_are_invalid() {
        let session = MemorySessionStore::new();
        session.set(TEST_PARAMS_KEY, serde_json::to_string(&params(0, 10)).unwrap());
        let loader = loader(FakeDocuments::default(), no_special());

        let outcome = loader.resolve(&session, &LoadRequest::default()).await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert!(matches!(err, LoadError::InvalidParameters));
                assert_eq!(err.to_string(), "Invalid test parameters");
                assert_eq!(err.redirect_to(), DASHBOARD_PATH);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stored_parameters_without_question_key_are_invalid() {
        let session = MemorySessionStore::new();
        session.set(TEST_PARAMS_KEY, r#"{"duration":30,"testType":"custom"}"#.to_string());
        let loader = loader(FakeDocuments::default(), no_special());

        let outcome = loader.resolve(&session, &LoadRequest::default()).await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert!(matches!(err, LoadError::InvalidParameters));
                assert_eq!(err.to_string(), "Invalid test parameters");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(session.get(TEST_PARAMS_KEY).is_none());
    }

    #[tokio::test]
    async fn broken_stored_blob_is_an_unexpected_failure_and_is_consumed() {
        let session = MemorySessionStore::new();
        session.set(TEST_PARAMS_KEY, "{not json".to_string());
        let loader = loader(FakeDocuments::default(), no_special());

        let outcome = loader.resolve(&session, &LoadRequest::default()).await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert!(matches!(err, LoadError::UnexpectedLoadFailure(_)));
                assert_eq!(err.to_string(), "Failed to load test");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(session.get(TEST_PARAMS_KEY).is_none());
    }

    #[tokio::test]
    async fn special_test_from_explicit_id() {
        let session = MemorySessionStore::new();
        let generated = params(12, 60);
        let loader = loader(
            FakeDocuments::default(),
            FakeSpecialTests::Returns(Some(generated.clone())),
        );

        let outcome = loader.resolve(&session, &LoadRequest::special("abc")).await;

        assert!(matches!(outcome, LoadOutcome::Loaded(ref p) if *p == generated));
    }

    #[tokio::test]
    async fn special_test_id_comes_from_path_when_not_given() {
        let session = MemorySessionStore::new();
        let loader = loader(
            FakeDocuments::default(),
            FakeSpecialTests::Returns(Some(params(5, 20))),
        );

        let outcome = loader
            .resolve(&session, &LoadRequest::at_path("/test/special/xyz"))
            .await;

        assert!(matches!(outcome, LoadOutcome::Loaded(_)));
    }

    #[tokio::test]
    async fn special_test_without_questions_fails() {
        let session = MemorySessionStore::new();
        let loader = loader(
            FakeDocuments::default(),
            FakeSpecialTests::Returns(Some(params(0, 20))),
        );

        let outcome = loader.resolve(&session, &LoadRequest::special("abc")).await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert!(matches!(err, LoadError::SpecialTestLoadFailed { .. }));
                let notification = err.notification();
                assert_eq!(notification.title, "Error");
                assert_eq!(notification.severity, Severity::Destructive);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_special_test_fails() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::default(), no_special());

        let outcome = loader.resolve(&session, &LoadRequest::special("gone")).await;

        assert!(matches!(
            outcome,
            LoadOutcome::Failed(LoadError::SpecialTestLoadFailed { ref test_id }) if test_id == "gone"
        ));
    }

    #[tokio::test]
    async fn special_test_service_error_is_unexpected() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::default(), FakeSpecialTests::Fails);

        let outcome = loader.resolve(&session, &LoadRequest::special("abc")).await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert!(matches!(err, LoadError::UnexpectedLoadFailure(_)));
                assert_eq!(
                    err.notification().description,
                    "Failed to load test data. Please try again."
                );
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn special_test_wins_over_year() {
        let session = MemorySessionStore::new();
        let loader = loader(
            FakeDocuments::with_count(65),
            FakeSpecialTests::Returns(Some(params(4, 20))),
        );
        let mut request = LoadRequest::previous_year("Paper 1", "2020");
        request.test_id = Some("abc".to_string());

        let outcome = loader.resolve(&session, &request).await;

        assert!(matches!(outcome, LoadOutcome::Loaded(ref p) if p.questions.len() == 4));
        assert!(loader.documents.queried().is_empty());
    }

    #[tokio::test]
    async fn previous_year_takes_first_65_in_store_order() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::with_count(80), no_special());

        let outcome = loader
            .resolve(&session, &LoadRequest::previous_year("Paper 1", "2020"))
            .await;

        let loaded = match outcome {
            LoadOutcome::Loaded(loaded) => loaded,
            other => panic!("expected a test, got {:?}", other),
        };
        assert_eq!(loaded.questions.len(), PYQ_QUESTION_COUNT);
        assert_eq!(loaded.questions[0].id, "doc000");
        assert_eq!(loaded.questions[64].id, "doc064");
        assert_eq!(loaded.duration, 180);
        assert_eq!(loaded.test_type, "PYQ");
        assert_eq!(loader.documents.queried(), vec!["pyqQuestions_Paper_1_2020"]);
    }

    #[tokio::test]
    async fn previous_year_with_64_questions_is_insufficient() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::with_count(64), no_special());

        let outcome = loader
            .resolve(&session, &LoadRequest::previous_year("Paper 1", "2020"))
            .await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert!(err.to_string().contains("64/65"));
                let notification = err.notification();
                assert_eq!(notification.title, "Insufficient questions");
                assert!(notification.description.contains("64/65"));
                assert!(notification.description.contains("Paper 1 2020"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn previous_year_with_no_questions() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::with_count(0), no_special());

        let outcome = loader
            .resolve(&session, &LoadRequest::previous_year("Paper 2", "2018"))
            .await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert_eq!(err.to_string(), "No questions found");
                assert_eq!(
                    err.notification().description,
                    "No questions found for Paper 2 2018. Please try another paper."
                );
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn document_store_error_is_unexpected() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::failing(), no_special());

        let outcome = loader
            .resolve(&session, &LoadRequest::previous_year("Paper 1", "2020"))
            .await;

        assert!(matches!(
            outcome,
            LoadOutcome::Failed(LoadError::UnexpectedLoadFailure(StoreError::Status { status: 503, .. }))
        ));
    }

    #[tokio::test]
    async fn nothing_to_load() {
        let session = MemorySessionStore::new();
        let loader = loader(FakeDocuments::with_count(65), no_special());
        let request = LoadRequest {
            year: Some(String::new()),
            test_id: Some(String::new()),
            current_path: Some("/test".to_string()),
            ..LoadRequest::default()
        };

        let outcome = loader.resolve(&session, &request).await;

        match outcome {
            LoadOutcome::Failed(err) => {
                assert_eq!(err.to_string(), "No test parameters found");
                assert_eq!(err.redirect_to(), "/dashboard");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(loader.documents.queried().is_empty());
    }

    #[tokio::test]
    async fn latest_load_is_applied() {
        let session = MemorySessionStore::new();
        let tracker = LoadTracker::default();
        let loader = loader(FakeDocuments::default(), FakeSpecialTests::Returns(Some(params(1, 5))));

        let stale = tracker.begin();
        let fresh = loader
            .load(&session, &tracker, &LoadRequest::special("abc"))
            .await;

        assert!(!tracker.is_current(stale));
        assert!(matches!(fresh, Some(LoadOutcome::Loaded(_))));
    }

    #[tokio::test]
    async fn superseded_load_is_discarded() {
        let session = MemorySessionStore::new();
        let tracker = Arc::new(LoadTracker::default());
        let loader = loader(
            FakeDocuments::default(),
            FakeSpecialTests::Superseded(tracker.clone()),
        );

        let outcome = loader
            .load(&session, &tracker, &LoadRequest::special("abc"))
            .await;

        assert!(outcome.is_none());
    }

    #[test]
    fn only_latest_ticket_is_current() {
        let tracker = LoadTracker::default();

        let first = tracker.begin();
        assert!(tracker.is_current(first));

        let second = tracker.begin();
        assert!(!tracker.is_current(first));
        assert!(tracker.is_current(second));
    }
}
