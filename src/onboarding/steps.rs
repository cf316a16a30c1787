//! Step handlers: one pure validation and transition function per state.
//!
//! A handler never touches storage or the chat platform. It inspects the
//! current record and the member's input and returns the update to persist
//! plus the side effects to perform afterwards. The dispatcher owns both.

use std::sync::LazyLock;

use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;

use super::messages;
use super::model::{Member, MemberUpdate};
use super::state::OnboardingState;

const MAX_NAME_LEN: usize = 64;
const MAX_EMAIL_LEN: usize = 254;
const MAX_BIO_LEN: usize = 500;
const MIN_NICKNAME_LEN: usize = 2;
const MAX_NICKNAME_LEN: usize = 32;
const VERIFICATION_CODE_LEN: usize = 32;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("email pattern is valid")
});

const AFFIRMATIVE: &[&str] = &["yes", "y", "yeah", "yep", "ok", "okay", "sure", "ready", "start"];

/// A side effect requested by a step handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Reply in the channel the member wrote from.
    Reply(String),
    /// Grant the configured member role.
    GrantRole,
}

/// What a handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// `None` means the record stays as it is.
    pub update: Option<MemberUpdate>,
    pub effects: Vec<Effect>,
}

impl StepOutcome {
    fn reprompt(state: OnboardingState) -> Self {
        Self {
            update: None,
            effects: vec![Effect::Reply(messages::reprompt_for(state).to_string())],
        }
    }

    /// Target state of the update, if the handler advanced.
    pub fn next_state(&self) -> Option<OnboardingState> {
        self.update.as_ref().and_then(|u| u.onboarding_state)
    }
}

/// Inputs a handler needs beyond the record and the message.
#[derive(Debug, Clone)]
pub struct StepContext<'a> {
    /// Code to hand out if this step issues a verification code.
    pub fresh_code: &'a str,
    /// Base URL of the verification endpoint.
    pub public_url: &'a str,
}

impl StepContext<'_> {
    pub fn verification_link(&self, code: &str) -> String {
        format!("{}/verify/{code}", self.public_url.trim_end_matches('/'))
    }
}

pub type StepHandler = fn(&Member, &str, &StepContext<'_>) -> StepOutcome;

/// Static state → handler table. `Member` has no handler.
pub fn handler_for(state: OnboardingState) -> Option<StepHandler> {
    match state {
        OnboardingState::Joined => Some(handle_joined),
        OnboardingState::FirstName => Some(handle_first_name),
        OnboardingState::LastName => Some(handle_last_name),
        OnboardingState::Email => Some(handle_email),
        OnboardingState::EmailVerification => Some(handle_email_verification),
        OnboardingState::Bio => Some(handle_bio),
        OnboardingState::Nickname => Some(handle_nickname),
        OnboardingState::Member => None,
    }
}

/// Generate a fresh, URL-safe verification code.
pub fn generate_verification_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(VERIFICATION_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Build the outcome of a successful step: advance and prompt for the next.
fn advance(from: OnboardingState, update: MemberUpdate) -> StepOutcome {
    let to = from.next().unwrap_or(OnboardingState::Member);
    let update = MemberUpdate {
        expected_state: Some(from),
        onboarding_state: Some(to),
        ..update
    };
    StepOutcome {
        update: Some(update),
        effects: vec![Effect::Reply(messages::prompt_for(to).to_string())],
    }
}

fn handle_joined(_member: &Member, input: &str, _ctx: &StepContext<'_>) -> StepOutcome {
    let answer = input.trim().trim_end_matches(['!', '.']).to_lowercase();
    if !AFFIRMATIVE.contains(&answer.as_str()) {
        return StepOutcome::reprompt(OnboardingState::Joined);
    }
    advance(OnboardingState::Joined, MemberUpdate::default())
}

fn handle_first_name(_member: &Member, input: &str, _ctx: &StepContext<'_>) -> StepOutcome {
    match valid_name(input) {
        Some(name) => advance(
            OnboardingState::FirstName,
            MemberUpdate {
                first_name: Some(name),
                ..Default::default()
            },
        ),
        None => StepOutcome::reprompt(OnboardingState::FirstName),
    }
}

fn handle_last_name(_member: &Member, input: &str, _ctx: &StepContext<'_>) -> StepOutcome {
    match valid_name(input) {
        Some(name) => advance(
            OnboardingState::LastName,
            MemberUpdate {
                last_name: Some(name),
                ..Default::default()
            },
        ),
        None => StepOutcome::reprompt(OnboardingState::LastName),
    }
}

fn handle_email(_member: &Member, input: &str, ctx: &StepContext<'_>) -> StepOutcome {
    let Some(email) = valid_email(input) else {
        return StepOutcome::reprompt(OnboardingState::Email);
    };
    let link = ctx.verification_link(ctx.fresh_code);
    StepOutcome {
        effects: vec![Effect::Reply(messages::verification_instructions(&email, &link))],
        update: Some(MemberUpdate {
            email: Some(email),
            verification_code: Some(ctx.fresh_code.to_string()),
            ..MemberUpdate::transition(OnboardingState::Email, OnboardingState::EmailVerification)
        }),
    }
}

/// Chat input never completes verification; it only re-sends the link.
fn handle_email_verification(member: &Member, input: &str, ctx: &StepContext<'_>) -> StepOutcome {
    let email = member.email.as_deref().unwrap_or_default();
    let wants_resend = input.trim().eq_ignore_ascii_case("resend");

    match (&member.verification_code, wants_resend) {
        (Some(code), false) => StepOutcome {
            update: None,
            effects: vec![
                Effect::Reply(messages::reprompt_for(OnboardingState::EmailVerification).to_string()),
                Effect::Reply(messages::verification_instructions(email, &ctx.verification_link(code))),
            ],
        },
        _ => StepOutcome {
            update: Some(MemberUpdate {
                verification_code: Some(ctx.fresh_code.to_string()),
                ..MemberUpdate::in_state(OnboardingState::EmailVerification)
            }),
            effects: vec![Effect::Reply(messages::verification_instructions(
                email,
                &ctx.verification_link(ctx.fresh_code),
            ))],
        },
    }
}

fn handle_bio(_member: &Member, input: &str, _ctx: &StepContext<'_>) -> StepOutcome {
    let bio = input.trim();
    if bio.is_empty() || bio.chars().count() > MAX_BIO_LEN {
        return StepOutcome::reprompt(OnboardingState::Bio);
    }
    advance(
        OnboardingState::Bio,
        MemberUpdate {
            bio: Some(bio.to_string()),
            ..Default::default()
        },
    )
}

/// Final step: completes onboarding instead of prompting further.
fn handle_nickname(member: &Member, input: &str, _ctx: &StepContext<'_>) -> StepOutcome {
    let nickname = input.trim();
    let len = nickname.chars().count();
    if !(MIN_NICKNAME_LEN..=MAX_NICKNAME_LEN).contains(&len) || has_control_chars(nickname) {
        return StepOutcome::reprompt(OnboardingState::Nickname);
    }
    StepOutcome {
        update: Some(MemberUpdate {
            nickname: Some(nickname.to_string()),
            ..MemberUpdate::transition(OnboardingState::Nickname, OnboardingState::Member)
        }),
        effects: vec![
            Effect::Reply(messages::onboarding_complete(member.first_name.as_deref())),
            Effect::GrantRole,
        ],
    }
}

fn valid_name(input: &str) -> Option<String> {
    let name = input.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN || has_control_chars(name) {
        return None;
    }
    Some(name.to_string())
}

fn valid_email(input: &str) -> Option<String> {
    let email = input.trim().to_lowercase();
    if email.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(&email) {
        return None;
    }
    Some(email)
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    const CTX: StepContext<'static> = StepContext {
        fresh_code: "freshcode",
        public_url: "https://onboard.example.com",
    };

    fn member_in(state: OnboardingState) -> Member {
        let now = Utc::now();
        Member {
            id: "1001".into(),
            username: "jdoe".into(),
            onboarding_state: state.to_string(),
            is_onboarded: false,
            first_name: Some("John".into()),
            last_name: None,
            email: Some("john@example.com".into()),
            bio: None,
            nickname: None,
            verification_code: None,
            joined_at: now,
            onboarded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn run(state: OnboardingState, input: &str) -> StepOutcome {
        let handler = handler_for(state).unwrap();
        handler(&member_in(state), input, &CTX)
    }

    fn replies(outcome: &StepOutcome) -> Vec<&str> {
        outcome
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Reply(text) => Some(text.as_str()),
                Effect::GrantRole => None,
            })
            .collect()
    }

    #[test]
    fn member_state_has_no_handler() {
        assert!(handler_for(OnboardingState::Member).is_none());
    }

    #[test]
    fn well_formed_input_advances_exactly_one_step() {
        let cases = [
            (OnboardingState::Joined, "Yes!"),
            (OnboardingState::FirstName, "john"),
            (OnboardingState::LastName, "Doe"),
            (OnboardingState::Email, "John.Doe@Example.com"),
            (OnboardingState::Bio, "I build compilers for fun."),
            (OnboardingState::Nickname, "jd"),
        ];
        for (state, input) in cases {
            let outcome = run(state, input);
            let update = outcome.update.as_ref().expect("valid input should produce an update");
            assert_eq!(update.expected_state, Some(state));
            assert!(
                state.can_transition_to(outcome.next_state().unwrap()),
                "{state} advanced to an invalid state"
            );
            assert_eq!(outcome.next_state(), state.next(), "{state} should advance one step");
        }
    }

    #[test]
    fn malformed_input_leaves_state_unchanged() {
        let long_name = "x".repeat(65);
        let long_bio = "y".repeat(501);
        let long_nickname = "n".repeat(33);
        let cases = [
            (OnboardingState::Joined, "what is this?"),
            (OnboardingState::FirstName, "   "),
            (OnboardingState::FirstName, long_name.as_str()),
            (OnboardingState::LastName, "bad\u{7}name"),
            (OnboardingState::Email, "not-an-email"),
            (OnboardingState::Email, "a@b"),
            (OnboardingState::Bio, ""),
            (OnboardingState::Bio, long_bio.as_str()),
            (OnboardingState::Nickname, "j"),
            (OnboardingState::Nickname, long_nickname.as_str()),
        ];
        for (state, input) in cases {
            let outcome = run(state, input);
            assert!(outcome.update.is_none(), "{state} accepted {input:?}");
            assert_eq!(replies(&outcome), vec![messages::reprompt_for(state)]);
        }
    }

    #[test]
    fn first_name_step_stores_name_and_prompts_for_last_name() {
        let outcome = run(OnboardingState::FirstName, "john");
        let update = outcome.update.as_ref().unwrap();
        assert_eq!(update.first_name.as_deref(), Some("john"));
        assert_eq!(update.onboarding_state, Some(OnboardingState::LastName));
        assert_eq!(replies(&outcome), vec![messages::prompt_for(OnboardingState::LastName)]);
    }

    #[test]
    fn email_step_issues_code_and_link() {
        let outcome = run(OnboardingState::Email, "  Jane@Example.COM ");
        let update = outcome.update.as_ref().unwrap();
        assert_eq!(update.email.as_deref(), Some("jane@example.com"));
        assert_eq!(update.verification_code.as_deref(), Some("freshcode"));
        assert_eq!(update.onboarding_state, Some(OnboardingState::EmailVerification));

        let reply = replies(&outcome)[0];
        assert!(reply.contains("https://onboard.example.com/verify/freshcode"));
        assert!(!outcome.effects.contains(&Effect::GrantRole));
    }

    #[test]
    fn verification_step_never_advances() {
        let mut member = member_in(OnboardingState::EmailVerification);
        member.verification_code = Some("existing".into());

        let outcome = handle_email_verification(&member, "i clicked it", &CTX);
        assert!(outcome.update.is_none());
        assert!(replies(&outcome)[1].contains("/verify/existing"));

        let resend = handle_email_verification(&member, "RESEND", &CTX);
        let update = resend.update.as_ref().unwrap();
        assert_eq!(update.onboarding_state, None);
        assert_eq!(update.verification_code.as_deref(), Some("freshcode"));
        assert!(replies(&resend)[0].contains("/verify/freshcode"));
    }

    #[test]
    fn nickname_step_completes_and_grants_role() {
        let outcome = run(OnboardingState::Nickname, "  jd  ");
        let update = outcome.update.as_ref().unwrap();
        assert_eq!(update.nickname.as_deref(), Some("jd"));
        assert_eq!(update.onboarding_state, Some(OnboardingState::Member));
        assert!(outcome.effects.contains(&Effect::GrantRole));
        assert_eq!(replies(&outcome), vec![messages::onboarding_complete(Some("John")).as_str()]);
    }

    #[test]
    fn generated_codes_are_alphanumeric_and_distinct() {
        let a = generate_verification_code();
        let b = generate_verification_code();
        assert_eq!(a.len(), VERIFICATION_CODE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn verification_link_trims_trailing_slash() {
        let ctx = StepContext {
            fresh_code: "c",
            public_url: "http://localhost:8080/",
        };
        assert_eq!(ctx.verification_link("abc"), "http://localhost:8080/verify/abc");
    }
}
