//! Outbound message copy for the onboarding conversation.
//!
//! Pure formatters: step + member fields in, text out.

use super::state::OnboardingState;

pub fn welcome(username: &str) -> String {
    format!(
        "Welcome to the community, {username}! 👋\n\
         Before you get full access we'd like to get to know you a little. \
         It only takes a couple of minutes.\n\n\
         Are you ready to start? Reply **yes** to begin."
    )
}

/// The prompt that asks for the input of `state`.
pub fn prompt_for(state: OnboardingState) -> &'static str {
    match state {
        OnboardingState::Joined => "Reply **yes** whenever you're ready to start.",
        OnboardingState::FirstName => "Great! What's your **first name**?",
        OnboardingState::LastName => "Thanks! And your **last name**?",
        OnboardingState::Email => {
            "What **email address** can we reach you at? We'll send you a link to verify it."
        }
        OnboardingState::EmailVerification => {
            "Please open the verification link we sent you to confirm your email."
        }
        OnboardingState::Bio => "Tell us a bit about yourself in a sentence or two.",
        OnboardingState::Nickname => {
            "Last one: what **nickname** would you like to use in the community?"
        }
        OnboardingState::Member => "",
    }
}

/// Clarifying re-prompt after invalid input for `state`.
pub fn reprompt_for(state: OnboardingState) -> &'static str {
    match state {
        OnboardingState::Joined => "No rush! Reply **yes** when you'd like to begin.",
        OnboardingState::FirstName => {
            "Hmm, that doesn't look like a first name. Please send just your first name (up to 64 characters)."
        }
        OnboardingState::LastName => {
            "Hmm, that doesn't look like a last name. Please send just your last name (up to 64 characters)."
        }
        OnboardingState::Email => {
            "That doesn't look like a valid email address. Please try again, e.g. `jane@example.com`."
        }
        OnboardingState::EmailVerification => {
            "We're still waiting for you to verify your email. Reply **resend** for a new link."
        }
        OnboardingState::Bio => "Please send a short bio (up to 500 characters).",
        OnboardingState::Nickname => "Nicknames must be between 2 and 32 characters. Try another one?",
        OnboardingState::Member => "",
    }
}

pub fn verification_instructions(email: &str, link: &str) -> String {
    format!(
        "Thanks! To confirm **{email}** belongs to you, open this link:\n{link}\n\n\
         Once verified you'll get full access right away."
    )
}

pub fn onboarding_complete(first_name: Option<&str>) -> String {
    match first_name {
        Some(name) => format!(
            "You're all set, {name}! 🎉 You now have full access to the community. Say hi!"
        ),
        None => "You're all set! 🎉 You now have full access to the community. Say hi!".to_string(),
    }
}

/// Public announcement posted when a member finishes onboarding.
pub fn member_announcement(member_id: &str) -> String {
    format!("Please welcome our newest member <@{member_id}>! 🎉")
}

pub fn cannot_understand_you() -> &'static str {
    "Sorry, I can't understand you. You're already fully onboarded, \
     so there's nothing left to do here!"
}

/// Nudge for members who joined but never started.
pub fn follow_up_joined1(username: &str) -> String {
    format!(
        "Hey {username}, just checking in! 👋 You joined a little while ago but haven't \
         started onboarding yet. Reply **yes** here and we'll get you set up in no time."
    )
}
