//! Inline control sets and the `action?k=v` token scheme.
//!
//! Tokens are parsed once at the boundary into a closed set of action
//! variants; missing or non-numeric parameters surface as validation errors,
//! never as a crash.

use crate::error::ValidationError;
use crate::types::{PaymentOption, PaymentOptionId, ResponseId, TaskId};
use url::form_urlencoded;

pub const LABEL_CANCEL: &str = "Cancel";
pub const LABEL_CLOSE: &str = "Close";
pub const LABEL_REPEAT: &str = "Repeat";

const ACTION_SELECT_OFFER: &str = "select-offer-option";
const ACTION_CANCEL_OFFER: &str = "cancel-offer";
const ACTION_CLOSE_TASK: &str = "close-task";
const ACTION_CANCEL_TASK: &str = "cancel-task";
const ACTION_REPEAT_TASK: &str = "repeat-task";

const PARAM_TASK: &str = "task";
const PARAM_OPTION: &str = "option";
const PARAM_RESPONSE: &str = "response";

/// Inline control set attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Markup {
    pub rows: Vec<Vec<Button>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: String,
}

impl Button {
    fn new(label: impl Into<String>, action: &Action) -> Self {
        Self {
            label: label.into(),
            action: action.encode(),
        }
    }
}

/// Closed set of inline-control actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SelectOffer { task: TaskId, option: PaymentOptionId },
    CancelOffer { response: ResponseId },
    CloseTask { task: TaskId },
    CancelTask { task: TaskId },
    RepeatTask { task: TaskId },
}

impl Action {
    pub fn encode(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let name = match self {
            Action::SelectOffer { task, option } => {
                query.append_pair(PARAM_OPTION, &option.0.to_string());
                query.append_pair(PARAM_TASK, &task.0.to_string());
                ACTION_SELECT_OFFER
            }
            Action::CancelOffer { response } => {
                query.append_pair(PARAM_RESPONSE, &response.0.to_string());
                ACTION_CANCEL_OFFER
            }
            Action::CloseTask { task } => {
                query.append_pair(PARAM_TASK, &task.0.to_string());
                ACTION_CLOSE_TASK
            }
            Action::CancelTask { task } => {
                query.append_pair(PARAM_TASK, &task.0.to_string());
                ACTION_CANCEL_TASK
            }
            Action::RepeatTask { task } => {
                query.append_pair(PARAM_TASK, &task.0.to_string());
                ACTION_REPEAT_TASK
            }
        };
        format!("{name}?{}", query.finish())
    }

    pub fn parse(data: &str) -> Result<Action, ValidationError> {
        let (name, query) = data
            .split_once('?')
            .ok_or(ValidationError::MissingActionParams)?;

        let params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let int_param = |key: &'static str| -> Result<i64, ValidationError> {
            params
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.parse::<i64>().ok())
                .ok_or(ValidationError::BadActionParam(key))
        };

        match name {
            ACTION_SELECT_OFFER => Ok(Action::SelectOffer {
                task: TaskId(int_param(PARAM_TASK)?),
                option: PaymentOptionId(int_param(PARAM_OPTION)?),
            }),
            ACTION_CANCEL_OFFER => Ok(Action::CancelOffer {
                response: ResponseId(int_param(PARAM_RESPONSE)?),
            }),
            ACTION_CLOSE_TASK => Ok(Action::CloseTask {
                task: TaskId(int_param(PARAM_TASK)?),
            }),
            ACTION_CANCEL_TASK => Ok(Action::CancelTask {
                task: TaskId(int_param(PARAM_TASK)?),
            }),
            ACTION_REPEAT_TASK => Ok(Action::RepeatTask {
                task: TaskId(int_param(PARAM_TASK)?),
            }),
            other => Err(ValidationError::UnknownAction(other.to_string())),
        }
    }
}

/// Creator controls while a task is open: cancel, close, repeat.
pub fn creator_controls(task: TaskId) -> Markup {
    Markup {
        rows: vec![vec![
            Button::new(LABEL_CANCEL, &Action::CancelTask { task }),
            Button::new(LABEL_CLOSE, &Action::CloseTask { task }),
            Button::new(LABEL_REPEAT, &Action::RepeatTask { task }),
        ]],
    }
}

/// Creator controls on a closed task: repeat only.
pub fn repeat_only(task: TaskId) -> Markup {
    Markup {
        rows: vec![vec![Button::new(LABEL_REPEAT, &Action::RepeatTask { task })]],
    }
}

/// One button per payment option, shown to potential respondents.
pub fn offer_options(task: TaskId, options: &[PaymentOption]) -> Markup {
    Markup {
        rows: options
            .iter()
            .map(|option| {
                vec![Button::new(
                    option.name.clone(),
                    &Action::SelectOffer {
                        task,
                        option: option.id,
                    },
                )]
            })
            .collect(),
    }
}

/// Retract control shown to a respondent with an open offer.
pub fn retract_offer(response: ResponseId) -> Markup {
    Markup {
        rows: vec![vec![Button::new(
            LABEL_CANCEL,
            &Action::CancelOffer { response },
        )]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips() {
        let actions = [
            Action::SelectOffer {
                task: TaskId(7),
                option: PaymentOptionId(3),
            },
            Action::CancelOffer {
                response: ResponseId(12),
            },
            Action::CloseTask { task: TaskId(7) },
            Action::CancelTask { task: TaskId(7) },
            Action::RepeatTask { task: TaskId(7) },
        ];
        for action in actions {
            assert_eq!(Action::parse(&action.encode()), Ok(action));
        }
    }

    #[test]
    fn parse_rejects_missing_and_non_numeric_params() {
        assert_eq!(
            Action::parse("close-task"),
            Err(ValidationError::MissingActionParams)
        );
        assert_eq!(
            Action::parse("close-task?other=1"),
            Err(ValidationError::BadActionParam("task"))
        );
        assert_eq!(
            Action::parse("close-task?task=abc"),
            Err(ValidationError::BadActionParam("task"))
        );
        assert_eq!(
            Action::parse("reopen-task?task=1"),
            Err(ValidationError::UnknownAction("reopen-task".into()))
        );
    }

    #[test]
    fn offer_options_one_row_per_option() {
        let options = vec![
            PaymentOption {
                id: PaymentOptionId(1),
                name: "50/50".into(),
                description: None,
            },
            PaymentOption {
                id: PaymentOptionId(2),
                name: "70/30".into(),
                description: None,
            },
        ];
        let markup = offer_options(TaskId(4), &options);
        assert_eq!(markup.rows.len(), 2);
        assert_eq!(markup.rows[0][0].label, "50/50");
        assert!(markup.rows[1][0].action.contains("option=2"));
    }
}
