//! Prompt templates for the travel-planning assistant.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces.
//! A [`PromptLibrary`] starts with the built-in templates, can load more from
//! a directory of JSON files, and can export its contents back to disk.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};
use crate::types::{ChatMessage, Role};

/// Variable bindings for rendering a template.
pub type Variables = HashMap<String, String>;

/// Build [`Variables`] from string pairs.
pub fn vars<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Variables
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern compiles")
});

const FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// What a template is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    System,
    User,
    Assistant,
    Chat,
    Completion,
}

/// A named prompt template.  Serialized as one JSON file per template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PromptKind,
    pub template: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Variables callers must supply.
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub examples: Option<Vec<serde_json::Value>>,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, kind: PromptKind, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            template: template.into(),
            description: None,
            variables: None,
            examples: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_variables(mut self, variables: &[&str]) -> Self {
        self.variables = Some(variables.iter().map(|v| (*v).to_owned()).collect());
        self
    }

    /// Placeholder names that occur in the template text.
    pub fn placeholders(&self) -> BTreeSet<&str> {
        PLACEHOLDER
            .captures_iter(&self.template)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect()
    }

    /// Declared variables that `vars` does not bind.
    pub fn missing_variables(&self, vars: &Variables) -> Vec<String> {
        self.variables
            .iter()
            .flatten()
            .filter(|name| !vars.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Substitute every placeholder.  Fails on the first placeholder without
    /// a binding.  Substituted values are not scanned again.
    pub fn format(&self, vars: &Variables) -> Result<String> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(&self.template, |caps: &Captures<'_>| {
            match caps.get(1) {
                Some(name) => match vars.get(name.as_str()) {
                    Some(value) => value.clone(),
                    None => {
                        missing.get_or_insert_with(|| name.as_str().to_owned());
                        String::new()
                    }
                },
                None if &caps[0] == "{{" => "{".to_owned(),
                None => "}".to_owned(),
            }
        });
        match missing {
            Some(name) => Err(template_error(format!(
                "template {:?} is missing variable {name:?}",
                self.name
            ))),
            None => Ok(rendered.into_owned()),
        }
    }
}

fn template_error(reason: impl Into<String>) -> InferenceError {
    InferenceError::Template {
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Helper arguments
// ---------------------------------------------------------------------------

/// Arguments for the `travel_planning` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TravelPlan {
    pub destination: String,
    pub duration: String,
    pub budget: String,
    pub travelers: String,
    pub interests: String,
    pub special_requirements: String,
}

impl TravelPlan {
    pub fn new(destination: impl Into<String>, duration: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            duration: duration.into(),
            budget: "moderate".into(),
            travelers: "2 people".into(),
            interests: "sightseeing, food".into(),
            special_requirements: "none".into(),
        }
    }
}

/// Arguments for the `attraction_recommendation` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttractionQuery {
    pub destination: String,
    pub attraction_type: String,
    pub count: u32,
    pub target_audience: String,
    pub budget_level: String,
}

impl AttractionQuery {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            attraction_type: "popular".into(),
            count: 5,
            target_audience: "general visitors".into(),
            budget_level: "moderate".into(),
        }
    }
}

/// Arguments for the `food_recommendation` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoodQuery {
    pub destination: String,
    pub cuisine_preference: String,
    pub price_range: String,
    pub dining_scene: String,
    pub dietary_restrictions: String,
}

impl FoodQuery {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            cuisine_preference: "local specialties".into(),
            price_range: "mid-range".into(),
            dining_scene: "regular meals".into(),
            dietary_restrictions: "none".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

/// A set of templates keyed by name.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<String, PromptTemplate>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptLibrary {
    /// A library holding the built-in templates.
    pub fn new() -> Self {
        let mut library = Self::empty();
        for template in builtin_templates() {
            library.add(template);
        }
        tracing::debug!(count = library.templates.len(), "built-in prompt templates loaded");
        library
    }

    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Built-in templates plus every `*.json` template in `dir`.
    pub fn with_dir(dir: &Path) -> Result<Self> {
        let mut library = Self::new();
        library.load_dir(dir)?;
        Ok(library)
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.get(name)
    }

    /// Template names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Insert or replace a template.
    pub fn add(&mut self, template: PromptTemplate) {
        tracing::trace!(name = %template.name, "prompt template registered");
        self.templates.insert(template.name.clone(), template);
    }

    pub fn remove(&mut self, name: &str) -> Option<PromptTemplate> {
        self.templates.remove(name)
    }

    /// Render a template after checking its declared variables.
    pub fn render(&self, name: &str, vars: &Variables) -> Result<String> {
        let template = self.require(name)?;
        let missing = template.missing_variables(vars);
        if !missing.is_empty() {
            return Err(template_error(format!(
                "template {name:?} is missing variables: {}",
                missing.join(", ")
            )));
        }
        template.format(vars)
    }

    fn require(&self, name: &str) -> Result<&PromptTemplate> {
        self.get(name)
            .ok_or_else(|| template_error(format!("template {name:?} not found")))
    }

    // -- Files ---------------------------------------------------------------

    /// Load every `*.json` template in `dir`.  Files that fail to parse are
    /// skipped with a warning.  Returns the number loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match load_template(&path) {
                Ok(template) => {
                    tracing::debug!(name = %template.name, path = %path.display(), "prompt template loaded");
                    self.add(template);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping prompt template file");
                }
            }
        }
        Ok(loaded)
    }

    /// Write one template as pretty JSON.
    pub fn save_template(&self, name: &str, path: &Path) -> Result<()> {
        let template = self.require(name)?;
        let json = serde_json::to_string_pretty(template)?;
        std::fs::write(path, json)?;
        tracing::debug!(name, path = %path.display(), "prompt template saved");
        Ok(())
    }

    /// Write every template to `<dir>/<name>.json`, creating `dir` if needed.
    pub fn export_all(&self, dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(dir)?;
        let names = self.names();
        for name in &names {
            self.save_template(name, &dir.join(format!("{name}.json")))?;
        }
        tracing::info!(count = names.len(), dir = %dir.display(), "prompt templates exported");
        Ok(names.len())
    }

    // -- Chat formatting -----------------------------------------------------

    /// Render a conversation in ChatML, ending with an open assistant turn.
    ///
    /// The last system message wins; without one the `travel_system` prompt
    /// is used.  When the `chatml` template has been removed a plain-text
    /// layout is produced instead.
    pub fn format_chat_prompt(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut system = None;
        let mut conversation = String::new();
        for message in messages {
            match message.role {
                Role::System => system = Some(message.content.as_str()),
                Role::User => {
                    let _ = writeln!(conversation, "<|im_start|>user\n{}<|im_end|>", message.content);
                }
                Role::Assistant => {
                    let _ = writeln!(
                        conversation,
                        "<|im_start|>assistant\n{}<|im_end|>",
                        message.content
                    );
                }
            }
        }

        let system = system
            .filter(|s| !s.is_empty())
            .or_else(|| self.get("travel_system").map(|t| t.template.as_str()))
            .unwrap_or(FALLBACK_SYSTEM_PROMPT);

        match self.get("chatml") {
            Some(template) => template.format(&vars([
                ("system_message", system),
                ("conversation", conversation.as_str()),
            ])),
            None => Ok(format!("System: {system}\n\n{conversation}\nAssistant:")),
        }
    }

    // -- Travel helpers ------------------------------------------------------

    pub fn travel_planning_prompt(&self, plan: &TravelPlan) -> Result<String> {
        self.render(
            "travel_planning",
            &vars([
                ("destination", plan.destination.as_str()),
                ("duration", plan.duration.as_str()),
                ("budget", plan.budget.as_str()),
                ("travelers", plan.travelers.as_str()),
                ("interests", plan.interests.as_str()),
                ("special_requirements", plan.special_requirements.as_str()),
            ]),
        )
    }

    pub fn attraction_prompt(&self, query: &AttractionQuery) -> Result<String> {
        self.render(
            "attraction_recommendation",
            &vars([
                ("destination", query.destination.clone()),
                ("attraction_type", query.attraction_type.clone()),
                ("count", query.count.to_string()),
                ("target_audience", query.target_audience.clone()),
                ("budget_level", query.budget_level.clone()),
            ]),
        )
    }

    pub fn food_prompt(&self, query: &FoodQuery) -> Result<String> {
        self.render(
            "food_recommendation",
            &vars([
                ("destination", query.destination.as_str()),
                ("cuisine_preference", query.cuisine_preference.as_str()),
                ("price_range", query.price_range.as_str()),
                ("dining_scene", query.dining_scene.as_str()),
                ("dietary_restrictions", query.dietary_restrictions.as_str()),
            ]),
        )
    }
}

fn load_template(path: &Path) -> Result<PromptTemplate> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn builtin_templates() -> Vec<PromptTemplate> {
    vec![
        PromptTemplate::new(
            "chatml",
            PromptKind::Chat,
            "<|im_start|>system\n{system_message}<|im_end|>\n{conversation}<|im_start|>assistant\n",
        )
        .with_description("ChatML conversation layout used by Qwen models")
        .with_variables(&["system_message", "conversation"]),
        PromptTemplate::new(
            "travel_system",
            PromptKind::System,
            "You are a professional AI travel planning assistant. Your job is to help \
             users put together detailed, practical travel plans.\n\
             \n\
             Follow these principles:\n\
             1. Give accurate, up-to-date travel information\n\
             2. Take the user's budget, schedule and preferences into account\n\
             3. Recommend local attractions, food and cultural experiences\n\
             4. Offer practical advice on transport, accommodation and safety\n\
             5. Stay friendly and professional\n\
             \n\
             Make sure the information you give is accurate and useful.",
        )
        .with_description("System prompt for travel planning"),
        PromptTemplate::new(
            "travel_planning",
            PromptKind::User,
            "Please create a {duration} travel plan for {destination}.\n\
             \n\
             Trip details:\n\
             - Destination: {destination}\n\
             - Duration: {duration}\n\
             - Budget: {budget}\n\
             - Travelers: {travelers}\n\
             - Interests: {interests}\n\
             - Special requirements: {special_requirements}\n\
             \n\
             Please include:\n\
             1. A day-by-day itinerary\n\
             2. Recommended attractions and activities\n\
             3. Accommodation suggestions\n\
             4. Transport options\n\
             5. Food recommendations\n\
             6. A budget breakdown\n\
             7. Things to watch out for",
        )
        .with_description("Travel plan request")
        .with_variables(&[
            "destination",
            "duration",
            "budget",
            "travelers",
            "interests",
            "special_requirements",
        ]),
        PromptTemplate::new(
            "attraction_recommendation",
            PromptKind::User,
            "Please recommend {attraction_type} attractions in {destination}.\n\
             \n\
             Requirements:\n\
             - Attraction type: {attraction_type}\n\
             - Number of recommendations: {count}\n\
             - Audience: {target_audience}\n\
             - Budget level: {budget_level}\n\
             \n\
             For each attraction, provide:\n\
             1. Name and a short introduction\n\
             2. Opening hours and ticket prices\n\
             3. How to get there\n\
             4. Visiting tips\n\
             5. Nearby facilities",
        )
        .with_description("Attraction recommendations")
        .with_variables(&[
            "destination",
            "attraction_type",
            "count",
            "target_audience",
            "budget_level",
        ]),
        PromptTemplate::new(
            "food_recommendation",
            PromptKind::User,
            "Please recommend local dishes and restaurants in {destination}.\n\
             \n\
             Preferences:\n\
             - Cuisine: {cuisine_preference}\n\
             - Price range: {price_range}\n\
             - Occasion: {dining_scene}\n\
             - Dietary restrictions: {dietary_restrictions}\n\
             \n\
             Please recommend:\n\
             1. Local specialty dishes\n\
             2. Restaurants, with address and price level\n\
             3. Street food\n\
             4. Dining etiquette and tips",
        )
        .with_description("Food and restaurant recommendations")
        .with_variables(&[
            "destination",
            "cuisine_preference",
            "price_range",
            "dining_scene",
            "dietary_restrictions",
        ]),
    ]
}
