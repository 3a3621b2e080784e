mod config;
mod quiz;

use std::sync::Arc;

use config::Config;
use dotenv::dotenv;
use log::{debug, error, info};
use quiz::{
    firestore::FirestoreDocumentStore,
    loader::{special_test_id_from_path, LoadOutcome, LoadRequest, Notification, Severity, TestLoader},
    session::TestSession,
    special::HttpSpecialTestService,
    store::{ChatSessions, SessionStore},
    Answer, QuestionStatus, TEST_PARAMS_KEY,
};
use teloxide::{
    dispatching::dialogue::{serializer::Json, ErasedStorage, SqliteStorage, Storage},
    prelude::*,
    types::{ChatAction, KeyboardButton, KeyboardMarkup, ParseMode},
    utils::html,
};

type QuizDialogue = Dialogue<State, ErasedStorage<State>>;
type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type DialogueStorage = std::sync::Arc<ErasedStorage<State>>;
type Loader = TestLoader<FirestoreDocumentStore, HttpSpecialTestService>;

#[derive(Clone, Default, serde::Serialize, serde::Deserialize)]
pub enum State {
    #[default]
    Start,
    Dashboard,
    ReceivePaperType,
    ReceiveYear {
        paper_type: String,
    },
    ReceiveSpecialTestId,
    ReceiveCustomTest,
    TakingTest {
        session: TestSession,
        current: usize,
        /// Unix time the current question was shown at
        shown_at: i64,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    pretty_env_logger::init();
    info!("Starting mock test bot...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            return;
        }
    };

    let bot = Bot::from_env();

    info!("Opening dialogue storage at {}", config.dialogue_db_path);
    let storage: DialogueStorage = match SqliteStorage::open(&config.dialogue_db_path, Json).await {
        Ok(storage) => storage.erase(),
        Err(err) => {
            error!("Failed to open dialogue storage: {}", err);
            return;
        }
    };

    let loader: Arc<Loader> = Arc::new(TestLoader::new(
        FirestoreDocumentStore::new(
            config.firestore_base_url.clone(),
            config.firebase_project_id.clone(),
            config.firebase_api_key.clone(),
        ),
        HttpSpecialTestService::new(config.special_test_service_url.clone()),
    ));
    let sessions = Arc::new(ChatSessions::new());

    Dispatcher::builder(
        bot,
        Update::filter_message()
            .enter_dialogue::<Message, ErasedStorage<State>, State>()
            .branch(dptree::case![State::Start].endpoint(start))
            .branch(dptree::case![State::Dashboard].endpoint(dashboard))
            .branch(dptree::case![State::ReceivePaperType].endpoint(receive_paper_type))
            .branch(dptree::case![State::ReceiveYear { paper_type }].endpoint(receive_year))
            .branch(dptree::case![State::ReceiveSpecialTestId].endpoint(receive_special_test_id))
            .branch(dptree::case![State::ReceiveCustomTest].endpoint(receive_custom_test))
            .branch(
                dptree::case![State::TakingTest {
                    session,
                    current,
                    shown_at
                }]
                .endpoint(taking_test),
            ),
    )
    .dependencies(dptree::deps![storage, loader, sessions])
    .enable_ctrlc_handler()
    .build()
    .dispatch()
    .await;
}

const GREETING_TEXT: &str = "Hi! I run mock tests: previous year papers, special tests and your own custom tests.";

const PREVIOUS_YEAR_BUTTON: &str = "Previous year paper";
const SPECIAL_TEST_BUTTON: &str = "Special test";
const CUSTOM_TEST_BUTTON: &str = "Custom test";
const PAPER_TYPES: [&str; 2] = ["Paper 1", "Paper 2"];

const SKIP_BUTTON: &str = "Skip";
const MARK_FOR_REVIEW_BUTTON: &str = "Mark for review";
const FINISH_BUTTON: &str = "Finish";

fn dashboard_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(PREVIOUS_YEAR_BUTTON)],
        vec![
            KeyboardButton::new(SPECIAL_TEST_BUTTON),
            KeyboardButton::new(CUSTOM_TEST_BUTTON),
        ],
    ])
}

// The bot's "/dashboard"
async fn show_dashboard(bot: &Bot, chat_id: ChatId) -> HandlerResult {
    bot.send_message(chat_id, "What would you like to do?")
        .reply_markup(dashboard_keyboard())
        .await?;
    Ok(())
}

async fn start(bot: Bot, dialogue: QuizDialogue, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, GREETING_TEXT).await?;
    show_dashboard(&bot, msg.chat.id).await?;

    dialogue.update(State::Dashboard).await?;
    Ok(())
}

async fn dashboard(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    loader: Arc<Loader>,
    sessions: Arc<ChatSessions>,
) -> HandlerResult {
    if let Some(request) = msg.text().and_then(path_request) {
        return start_test(&bot, &dialogue, &msg, &loader, &sessions, request).await;
    }

    match msg.text() {
        Some(PREVIOUS_YEAR_BUTTON) => {
            let keyboard = KeyboardMarkup::new(vec![PAPER_TYPES
                .iter()
                .map(|paper| KeyboardButton::new(*paper))
                .collect::<Vec<_>>()]);
            bot.send_message(msg.chat.id, "Which paper?")
                .reply_markup(keyboard)
                .await?;
            dialogue.update(State::ReceivePaperType).await?;
        }
        Some(SPECIAL_TEST_BUTTON) => {
            bot.send_message(msg.chat.id, "Send me the special test id")
                .await?;
            dialogue.update(State::ReceiveSpecialTestId).await?;
        }
        Some(CUSTOM_TEST_BUTTON) => {
            bot.send_message(
                msg.chat.id,
                "Paste the test as JSON: {\"questions\": [...], \"duration\": minutes, \"testType\": \"...\"}",
            )
            .await?;
            dialogue.update(State::ReceiveCustomTest).await?;
        }
        _ => {
            show_dashboard(&bot, msg.chat.id).await?;
        }
    }
    Ok(())
}

/// A pasted link or path like `https://host/test/special/<id>` is taken as the current path.
fn path_request(text: &str) -> Option<LoadRequest> {
    let text = text.trim();
    special_test_id_from_path(text)?;
    Some(LoadRequest::at_path(text))
}

async fn receive_paper_type(bot: Bot, dialogue: QuizDialogue, msg: Message) -> HandlerResult {
    match msg.text() {
        Some(paper_type) if PAPER_TYPES.iter().any(|paper| *paper == paper_type) => {
            bot.send_message(msg.chat.id, "Which year? (e.g. 2020)")
                .await?;
            dialogue
                .update(State::ReceiveYear {
                    paper_type: paper_type.to_string(),
                })
                .await?;
        }
        _ => {
            bot.send_message(msg.chat.id, "Please choose one of the papers")
                .await?;
        }
    }
    Ok(())
}

async fn receive_year(
    bot: Bot,
    dialogue: QuizDialogue,
    paper_type: String,
    msg: Message,
    loader: Arc<Loader>,
    sessions: Arc<ChatSessions>,
) -> HandlerResult {
    let year = match msg.text().map(str::trim) {
        Some(year) if !year.is_empty() => year.to_string(),
        _ => {
            bot.send_message(msg.chat.id, "Please send the year as text")
                .await?;
            return Ok(());
        }
    };

    let request = LoadRequest::previous_year(&paper_type, &year);
    start_test(&bot, &dialogue, &msg, &loader, &sessions, request).await
}

async fn receive_special_test_id(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    loader: Arc<Loader>,
    sessions: Arc<ChatSessions>,
) -> HandlerResult {
    let request = LoadRequest::special(msg.text().unwrap_or_default().trim());
    start_test(&bot, &dialogue, &msg, &loader, &sessions, request).await
}

async fn receive_custom_test(
    bot: Bot,
    dialogue: QuizDialogue,
    msg: Message,
    loader: Arc<Loader>,
    sessions: Arc<ChatSessions>,
) -> HandlerResult {
    // Handed over through the session store, just like a test set up elsewhere would be
    if let Some(text) = msg.text() {
        sessions
            .get_or_create(msg.chat.id.0)
            .store
            .set(TEST_PARAMS_KEY, text.to_string());
    }
    start_test(&bot, &dialogue, &msg, &loader, &sessions, LoadRequest::default()).await
}

async fn start_test(
    bot: &Bot,
    dialogue: &QuizDialogue,
    msg: &Message,
    loader: &Loader,
    sessions: &ChatSessions,
    request: LoadRequest,
) -> HandlerResult {
    let chat_id = msg.chat.id;
    let chat = sessions.get_or_create(chat_id.0);

    // Only cosmetic, so a failure here does not matter
    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;

    let outcome = match loader.load(&chat.store, &chat.loads, &request).await {
        Some(outcome) => outcome,
        // A newer load for this chat is responsible for the reply
        None => return Ok(()),
    };

    let next_state = state_after_load(&outcome, msg.date.timestamp());

    match (&outcome, &next_state) {
        (LoadOutcome::Loaded(params), State::TakingTest { session, .. }) => {
            let ready = Notification::info(
                "Test ready",
                format!(
                    "{} questions, {}, {} minutes. Good luck!",
                    session.questions().len(),
                    session.test_type().unwrap_or(params.test_type.as_str()),
                    params.duration
                ),
            );
            notify(bot, chat_id, &ready).await?;
            send_question(bot, chat_id, session, 0).await?;
        }
        (LoadOutcome::Failed(err), _) => {
            notify(bot, chat_id, &err.notification()).await?;
            debug!("Redirecting chat {} to {}: {}", chat_id.0, err.redirect_to(), err);
            show_dashboard(bot, chat_id).await?;
        }
        _ => {}
    }

    dialogue.update(next_state).await?;
    Ok(())
}

/// Where the dialogue goes once a load has finished: into the test, or back to the dashboard.
fn state_after_load(outcome: &LoadOutcome, now: i64) -> State {
    let mut session = TestSession::new();
    session.apply(outcome);
    match outcome {
        LoadOutcome::Loaded(_) => {
            visit_question(&mut session, 0);
            State::TakingTest {
                session,
                current: 0,
                shown_at: now,
            }
        }
        LoadOutcome::Failed(_) => State::Dashboard,
    }
}

async fn notify(bot: &Bot, chat_id: ChatId, notification: &Notification) -> HandlerResult {
    let marker = match notification.severity {
        Severity::Destructive => "❗ ",
        Severity::Default => "",
    };
    bot.send_message(
        chat_id,
        format!(
            "{}<b>{}</b>\n{}",
            marker,
            html::escape(&notification.title),
            html::escape(&notification.description)
        ),
    )
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

fn format_seconds(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn set_status(session: &mut TestSession, index: usize, status: QuestionStatus) {
    let mut statuses = session.question_status().to_vec();
    if let Some(slot) = statuses.get_mut(index) {
        *slot = status;
    }
    session.set_question_status(statuses);
}

/// Returns `false` if the text holds no answer, the question is left untouched then.
fn record_answer(session: &mut TestSession, index: usize, text: &str) -> bool {
    let answer = match Answer::parse(text) {
        Some(answer) => answer,
        None => return false,
    };
    let mut answers = session.user_answers().to_vec();
    match answers.get_mut(index) {
        Some(slot) => *slot = Some(answer),
        None => return false,
    }
    session.set_user_answers(answers);

    let status = match session.question_status().get(index) {
        Some(QuestionStatus::MarkedForReview) | Some(QuestionStatus::AnsweredMarkedForReview) => {
            QuestionStatus::AnsweredMarkedForReview
        }
        _ => QuestionStatus::Answered,
    };
    set_status(session, index, status);
    true
}

fn mark_for_review(session: &mut TestSession, index: usize) {
    let status = match session.question_status().get(index) {
        Some(QuestionStatus::Answered) | Some(QuestionStatus::AnsweredMarkedForReview) => {
            QuestionStatus::AnsweredMarkedForReview
        }
        _ => QuestionStatus::MarkedForReview,
    };
    set_status(session, index, status);
}

/// Showing a question for the first time makes it "not answered".
fn visit_question(session: &mut TestSession, index: usize) {
    if session.question_status().get(index) == Some(&QuestionStatus::NotVisited) {
        set_status(session, index, QuestionStatus::NotAnswered);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TestStep {
    Show(usize),
    /// Nothing usable was sent, ask again for the same question
    Stay,
    Finish { time_up: bool },
}

fn advance(session: &mut TestSession, current: usize, elapsed: u32, text: Option<&str>) -> TestStep {
    session.spend(current, elapsed);
    if session.time_is_up() {
        return TestStep::Finish { time_up: true };
    }

    match text {
        Some(FINISH_BUTTON) | Some("/dashboard") => return TestStep::Finish { time_up: false },
        Some(SKIP_BUTTON) => {}
        Some(MARK_FOR_REVIEW_BUTTON) => mark_for_review(session, current),
        Some(text) => {
            if !record_answer(session, current, text) {
                return TestStep::Stay;
            }
        }
        None => return TestStep::Stay,
    }

    let next = current + 1;
    if next >= session.questions().len() {
        return TestStep::Finish { time_up: false };
    }
    visit_question(session, next);
    TestStep::Show(next)
}

async fn send_question(
    bot: &Bot,
    chat_id: ChatId,
    session: &TestSession,
    index: usize,
) -> HandlerResult {
    let question_id = session
        .questions()
        .get(index)
        .map(|question| question.id.clone())
        .unwrap_or_default();
    let text = format!(
        "Question №{} of {} (id {})\nTime left: {}\n\nReply with your answer, separate several options with commas.",
        index + 1,
        session.questions().len(),
        question_id,
        format_seconds(session.remaining_time())
    );

    bot.send_message(chat_id, text)
        .reply_markup(KeyboardMarkup::new(vec![vec![
            KeyboardButton::new(SKIP_BUTTON),
            KeyboardButton::new(MARK_FOR_REVIEW_BUTTON),
            KeyboardButton::new(FINISH_BUTTON),
        ]]))
        .await?;
    Ok(())
}

async fn taking_test(
    bot: Bot,
    dialogue: QuizDialogue,
    (session, current, shown_at): (TestSession, usize, i64),
    msg: Message,
) -> HandlerResult {
    let mut session = session;
    let now = msg.date.timestamp();
    let elapsed = u32::try_from((now - shown_at).max(0)).unwrap_or(u32::MAX);

    match advance(&mut session, current, elapsed, msg.text()) {
        TestStep::Finish { time_up } => {
            if time_up {
                bot.send_message(msg.chat.id, "Time is up!").await?;
            }
            finish_test(&bot, &dialogue, msg.chat.id, &session).await
        }
        TestStep::Stay => {
            bot.send_message(msg.chat.id, "Please send an answer as text, or press Skip")
                .await?;
            dialogue
                .update(State::TakingTest {
                    session,
                    current,
                    shown_at: now,
                })
                .await?;
            Ok(())
        }
        TestStep::Show(next) => {
            send_question(&bot, msg.chat.id, &session, next).await?;
            dialogue
                .update(State::TakingTest {
                    session,
                    current: next,
                    shown_at: now,
                })
                .await?;
            Ok(())
        }
    }
}

async fn finish_test(
    bot: &Bot,
    dialogue: &QuizDialogue,
    chat_id: ChatId,
    session: &TestSession,
) -> HandlerResult {
    let summary = format!(
        "Test finished!\nAnswered: {}\nMarked for review: {}\nNot answered: {}\nNot visited: {}\nTime left: {}",
        session.count_with_status(QuestionStatus::Answered)
            + session.count_with_status(QuestionStatus::AnsweredMarkedForReview),
        session.count_with_status(QuestionStatus::MarkedForReview)
            + session.count_with_status(QuestionStatus::AnsweredMarkedForReview),
        session.count_with_status(QuestionStatus::NotAnswered),
        session.count_with_status(QuestionStatus::NotVisited),
        format_seconds(session.remaining_time())
    );
    bot.send_message(chat_id, summary).await?;

    show_dashboard(bot, chat_id).await?;
    dialogue.update(State::Dashboard).await?;
    Ok(())
}
