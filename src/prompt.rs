//! System instruction sent in the session setup

/// Composes the agent's system instruction from user details and remembered facts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemPrompt {
    pub user_name: Option<String>,
    pub user_age: Option<String>,
    pub remembered_facts: Vec<String>,
}

const BASE: &str = "You are a highly advanced, truthful, and helpful AI assistant.";

const DIRECTIVES: &str = "Core Directives:
1. Be up-to-date: use your search tool to provide current and accurate information.
2. Absolute truthfulness: never lie or provide misleading information. If you don't know an answer, say so or perform a search.
3. Clarity: if a request is ambiguous, ask for clarification before proceeding.";

const SCREEN_DIRECTIVES: &str = "You also assist the user by accurately describing the content of their screen, which they can choose to share with you.

Screen sharing directives:
1. Privacy first: never read, repeat, or process personally identifiable information such as names, addresses, phone numbers, emails, passwords, or private keys. Treat anything related to money, trading, banking, or financial charts as sensitive. If you detect sensitive information, respond only with: \"For your privacy, I have detected potentially sensitive information and have stopped viewing the screen. Please hide the sensitive information before we continue.\"
2. Report, don't interpret: identify the application or website, then describe the layout, then read key UI elements verbatim.
3. If any part of the screen is blurry or unreadable, say so. Saying \"I cannot identify this element\" is better than guessing.";

impl SystemPrompt {
    fn user_details(&self) -> String {
        match (self.user_name.as_deref(), self.user_age.as_deref()) {
            (Some(name), Some(age)) => format!("You are assisting a user named {}, who is {} years old.", name, age),
            (Some(name), None) => format!("You are assisting a user named {}.", name),
            _ => "You are assisting a user.".to_string(),
        }
    }

    fn memory_block(&self) -> Option<String> {
        if self.remembered_facts.is_empty() {
            return None;
        }
        let facts: Vec<String> = self.remembered_facts.iter().map(|f| format!("- {}", f)).collect();
        Some(format!(
            "--- Start of User's Remembered Facts ---\nWeave these facts into the conversation naturally.\n\n{}\n--- End of User's Remembered Facts ---",
            facts.join("\n")
        ))
    }

    /// Render the full instruction text.
    pub fn render(&self) -> String {
        let mut sections = vec![format!("{}\n{}", BASE, self.user_details())];
        if let Some(memory) = self.memory_block() {
            sections.push(memory);
        }
        sections.push(DIRECTIVES.to_string());
        sections.push(SCREEN_DIRECTIVES.to_string());
        sections.join("\n\n")
    }
}
