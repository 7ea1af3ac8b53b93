//! Server-side forms shown to players.

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("invalid form response: {0}")]
    Invalid(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A form: its JSON body and the handling of the client's answer.
pub trait Form {
    fn to_json(&self) -> Value;

    /// `data` is `None` when the player closed the form.
    fn handle_response(&mut self, player: &str, data: Option<Value>) -> Result<(), FormError>;
}

type Action = Box<dyn FnMut(&str)>;

/// Yes/no dialog.
pub struct ModalForm {
    title: String,
    content: String,
    button1: (String, Option<Action>),
    button2: (String, Option<Action>),
}

impl ModalForm {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            button1: ("Yes".to_owned(), None),
            button2: ("No".to_owned(), None),
        }
    }

    pub fn button1(mut self, text: impl Into<String>, action: impl FnMut(&str) + 'static) -> Self {
        self.button1 = (text.into(), Some(Box::new(action)));
        self
    }

    pub fn button2(mut self, text: impl Into<String>, action: impl FnMut(&str) + 'static) -> Self {
        self.button2 = (text.into(), Some(Box::new(action)));
        self
    }
}

impl Form for ModalForm {
    fn to_json(&self) -> Value {
        json!({
            "type": "modal",
            "title": self.title,
            "content": self.content,
            "button1": self.button1.0,
            "button2": self.button2.0,
        })
    }

    fn handle_response(&mut self, player: &str, data: Option<Value>) -> Result<(), FormError> {
        let Some(data) = data else {
            return Ok(());
        };
        let choice = data
            .as_bool()
            .ok_or_else(|| FormError::Invalid(format!("expected a boolean, got {data}")))?;
        let action = if choice {
            &mut self.button1.1
        } else {
            &mut self.button2.1
        };
        if let Some(action) = action {
            action(player);
        }
        Ok(())
    }
}

/// A list of buttons.
pub struct SimpleForm {
    title: String,
    content: String,
    buttons: Vec<(String, Option<Action>)>,
}

impl SimpleForm {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            buttons: Vec::new(),
        }
    }

    pub fn button(mut self, text: impl Into<String>, action: impl FnMut(&str) + 'static) -> Self {
        self.buttons.push((text.into(), Some(Box::new(action))));
        self
    }
}

impl Form for SimpleForm {
    fn to_json(&self) -> Value {
        let buttons: Vec<Value> = self
            .buttons
            .iter()
            .map(|(text, _)| json!({ "text": text }))
            .collect();
        json!({
            "type": "form",
            "title": self.title,
            "content": self.content,
            "buttons": buttons,
        })
    }

    fn handle_response(&mut self, player: &str, data: Option<Value>) -> Result<(), FormError> {
        let Some(data) = data else {
            return Ok(());
        };
        let index = data
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| FormError::Invalid(format!("expected a button index, got {data}")))?;
        let (_, action) = self
            .buttons
            .get_mut(index)
            .ok_or_else(|| FormError::Invalid(format!("button {index} does not exist")))?;
        if let Some(action) = action {
            action(player);
        }
        Ok(())
    }
}

/// One row of a [`CustomForm`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CustomElement {
    Label {
        text: String,
    },
    Input {
        text: String,
        placeholder: String,
        default: String,
    },
    Toggle {
        text: String,
        default: bool,
    },
    Slider {
        text: String,
        min: f64,
        max: f64,
        step: f64,
        default: f64,
    },
    StepSlider {
        text: String,
        steps: Vec<String>,
        default: usize,
    },
    Dropdown {
        text: String,
        options: Vec<String>,
        default: usize,
    },
}

impl CustomElement {
    pub fn text(&self) -> &str {
        match self {
            CustomElement::Label { text }
            | CustomElement::Input { text, .. }
            | CustomElement::Toggle { text, .. }
            | CustomElement::Slider { text, .. }
            | CustomElement::StepSlider { text, .. }
            | CustomElement::Dropdown { text, .. } => text,
        }
    }

    /// Checks that `value` has the shape this element answers with.
    fn read(&self, value: &Value) -> Result<CustomValue, FormError> {
        let mismatch = || FormError::Invalid(format!("bad value {value} for '{}'", self.text()));
        let index_in = |len: usize| {
            value
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .filter(|&i| i < len)
                .map(CustomValue::Index)
        };
        let read = match self {
            CustomElement::Label { .. } => Some(CustomValue::None),
            CustomElement::Input { .. } => value.as_str().map(|s| CustomValue::Text(s.to_owned())),
            CustomElement::Toggle { .. } => value.as_bool().map(CustomValue::Bool),
            CustomElement::Slider { min, max, .. } => value
                .as_f64()
                .filter(|n| (*min..=*max).contains(n))
                .map(CustomValue::Number),
            CustomElement::StepSlider { steps, .. } => index_in(steps.len()),
            CustomElement::Dropdown { options, .. } => index_in(options.len()),
        };
        read.ok_or_else(mismatch)
    }
}

/// A validated answer to one [`CustomElement`].
#[derive(Debug, Clone, PartialEq)]
pub enum CustomValue {
    /// Labels carry no answer.
    None,
    Text(String),
    Bool(bool),
    Number(f64),
    /// Selected step or dropdown option.
    Index(usize),
}

type Validator = Box<dyn Fn(&CustomValue) -> bool>;
type SubmitAction = Box<dyn FnMut(&str, &[CustomValue])>;

/// A form of labels, inputs, toggles, sliders and dropdowns.
///
/// Every answer is type checked against its element, then passed through
/// the element's validator if it has one. The submit action only runs
/// when the whole response is valid.
pub struct CustomForm {
    title: String,
    elements: Vec<(CustomElement, Option<Validator>)>,
    on_submit: Option<SubmitAction>,
}

impl CustomForm {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            elements: Vec::new(),
            on_submit: None,
        }
    }

    pub fn element(mut self, element: CustomElement) -> Self {
        self.elements.push((element, None));
        self
    }

    pub fn label(self, text: impl Into<String>) -> Self {
        self.element(CustomElement::Label { text: text.into() })
    }

    pub fn input(self, text: impl Into<String>, placeholder: impl Into<String>, default: impl Into<String>) -> Self {
        self.element(CustomElement::Input {
            text: text.into(),
            placeholder: placeholder.into(),
            default: default.into(),
        })
    }

    pub fn toggle(self, text: impl Into<String>, default: bool) -> Self {
        self.element(CustomElement::Toggle {
            text: text.into(),
            default,
        })
    }

    pub fn slider(self, text: impl Into<String>, min: f64, max: f64, step: f64, default: f64) -> Self {
        self.element(CustomElement::Slider {
            text: text.into(),
            min,
            max,
            step,
            default,
        })
    }

    pub fn step_slider(self, text: impl Into<String>, steps: Vec<String>, default: usize) -> Self {
        self.element(CustomElement::StepSlider {
            text: text.into(),
            steps,
            default,
        })
    }

    pub fn dropdown(self, text: impl Into<String>, options: Vec<String>, default: usize) -> Self {
        self.element(CustomElement::Dropdown {
            text: text.into(),
            options,
            default,
        })
    }

    /// Attaches a validator to the most recently added element.
    pub fn validate(mut self, validator: impl Fn(&CustomValue) -> bool + 'static) -> Self {
        if let Some((_, slot)) = self.elements.last_mut() {
            *slot = Some(Box::new(validator));
        }
        self
    }

    pub fn on_submit(mut self, action: impl FnMut(&str, &[CustomValue]) + 'static) -> Self {
        self.on_submit = Some(Box::new(action));
        self
    }
}

impl Form for CustomForm {
    fn to_json(&self) -> Value {
        let content: Vec<&CustomElement> = self.elements.iter().map(|(element, _)| element).collect();
        json!({
            "type": "custom_form",
            "title": self.title,
            "content": content,
        })
    }

    fn handle_response(&mut self, player: &str, data: Option<Value>) -> Result<(), FormError> {
        let Some(data) = data else {
            return Ok(());
        };
        let answers = match data {
            Value::Array(answers) => answers,
            other => return Err(FormError::Invalid(format!("expected an array, got {other}"))),
        };

        let mut values = Vec::with_capacity(self.elements.len());
        for (index, (element, validator)) in self.elements.iter().enumerate() {
            let answer = answers.get(index).unwrap_or(&Value::Null);
            let value = element.read(answer)?;
            if let Some(validator) = validator {
                if !validator(&value) {
                    return Err(FormError::Invalid(format!("validation failed for '{}'", element.text())));
                }
            }
            values.push(value);
        }
        if let Some(action) = &mut self.on_submit {
            action(player, &values);
        }
        Ok(())
    }
}

/// Parses the `form_data` of a ModalFormResponse; JSON `null` means closed.
pub fn parse_response(form_data: Option<&str>) -> Result<Option<Value>, FormError> {
    match form_data {
        None => Ok(None),
        Some(raw) => match serde_json::from_str::<Value>(raw.trim())? {
            Value::Null => Ok(None),
            value => Ok(Some(value)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn modal_dispatches_to_button() {
        let pressed = Rc::new(RefCell::new(Vec::new()));
        let (yes, no) = (pressed.clone(), pressed.clone());
        let mut form = ModalForm::new("Confirm", "Really?")
            .button1("Sure", move |p| yes.borrow_mut().push(format!("yes:{p}")))
            .button2("Nope", move |p| no.borrow_mut().push(format!("no:{p}")));

        assert_eq!(form.to_json()["button1"], "Sure");
        form.handle_response("Steve", parse_response(Some("false\n")).unwrap())
            .unwrap();
        form.handle_response("Steve", parse_response(Some("null")).unwrap())
            .unwrap();
        assert_eq!(*pressed.borrow(), ["no:Steve"]);
        assert!(form.handle_response("Steve", Some(json!(3))).is_err());
    }

    #[test]
    fn simple_form_checks_index() {
        let mut form = SimpleForm::new("Servers", "").button("Lobby", |_| {});
        assert_eq!(form.to_json()["buttons"][0]["text"], "Lobby");
        assert!(form.handle_response("Alex", Some(json!(0))).is_ok());
        assert!(form.handle_response("Alex", Some(json!(1))).is_err());
    }

    fn settings_form(submitted: Rc<RefCell<Vec<CustomValue>>>) -> CustomForm {
        CustomForm::new("Settings")
            .label("Pick your options")
            .input("Nickname", "Steve", "")
            .validate(|value| matches!(value, CustomValue::Text(name) if !name.is_empty()))
            .toggle("Music", true)
            .slider("Volume", 0.0, 100.0, 5.0, 50.0)
            .dropdown("Server", vec!["lobby".to_owned(), "survival".to_owned()], 0)
            .on_submit(move |_, values| submitted.borrow_mut().extend_from_slice(values))
    }

    #[test]
    fn custom_form_serializes_elements() {
        let form = settings_form(Rc::default());
        let json = form.to_json();
        assert_eq!(json["type"], "custom_form");
        assert_eq!(json["content"][0], json!({ "type": "label", "text": "Pick your options" }));
        assert_eq!(json["content"][1]["placeholder"], "Steve");
        assert_eq!(json["content"][3]["type"], "slider");
        assert_eq!(json["content"][3]["max"], 100.0);
        assert_eq!(json["content"][4]["options"][1], "survival");
    }

    #[test]
    fn custom_form_validates_each_answer() {
        let submitted = Rc::new(RefCell::new(Vec::new()));
        let mut form = settings_form(submitted.clone());

        let answer = parse_response(Some(r#"[null, "Alex", false, 35, 1]"#)).unwrap();
        form.handle_response("Alex", answer).unwrap();
        assert_eq!(
            *submitted.borrow(),
            [
                CustomValue::None,
                CustomValue::Text("Alex".to_owned()),
                CustomValue::Bool(false),
                CustomValue::Number(35.0),
                CustomValue::Index(1),
            ]
        );

        let rejected = [
            json!([null, "", false, 35, 1]),
            json!([null, "Alex", "yes", 35, 1]),
            json!([null, "Alex", false, 120, 1]),
            json!([null, "Alex", false, 35, 2]),
            json!([null, "Alex", false]),
            json!({ "name": "Alex" }),
        ];
        for data in rejected {
            assert!(form.handle_response("Alex", Some(data.clone())).is_err(), "{data}");
        }
        assert_eq!(submitted.borrow().len(), 5);
        assert!(form.handle_response("Alex", None).is_ok());
    }
}
