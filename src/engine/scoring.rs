use crate::db::prelude::*;

/// Grades a submission.
///
/// `answers[i]` is the option index chosen for question `i`; missing,
/// out-of-range and unanswered entries count as wrong, extra entries are
/// ignored. A quiz without questions scores 0 % and never passes.
pub fn score_attempt(quiz: &Quiz, answers: &[Option<usize>], attempt_number: i32) -> AttemptScore {
    let total_questions = quiz.questions.len();
    let raw_score = quiz
        .questions
        .iter()
        .enumerate()
        .filter(|(idx, question)| {
            answers
                .get(*idx)
                .copied()
                .flatten()
                .and_then(|choice| question.options.get(choice))
                .is_some_and(|option| option.correct)
        })
        .count();

    let percentage = if total_questions == 0 {
        0
    } else {
        (raw_score as f64 / total_questions as f64 * 100.0).round() as i32
    };
    let passed = total_questions > 0 && percentage >= i32::from(quiz.pass_threshold);

    AttemptScore {
        raw_score: raw_score as i32,
        total_questions: total_questions as i32,
        percentage,
        passed,
        points_earned: points_for(&quiz.reward, attempt_number, percentage, passed),
    }
}

/// Points for one attempt under `policy`.
///
/// Bucketed schedules pay by attempt number alone. Decayed schedules pay
/// `base * pct/100 * decay^(attempt-1)`, rounded, and only on a pass.
pub fn points_for(policy: &RewardPolicy, attempt_number: i32, percentage: i32, passed: bool) -> i64 {
    match *policy {
        RewardPolicy::Bucketed {
            attempt1,
            attempt2,
            attempt3,
            attempt4_plus,
        } => match attempt_number {
            ..=1 => attempt1,
            2 => attempt2,
            3 => attempt3,
            _ => attempt4_plus,
        },
        RewardPolicy::Decayed {
            base_points,
            decay_factor,
        } => {
            if !passed {
                return 0;
            }

            let exponent = attempt_number.max(1) - 1;
            let earned = base_points as f64
                * (f64::from(percentage) / 100.0)
                * decay_factor.powi(exponent);

            earned.round().max(0.0) as i64
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::fixtures;

    fn answers(correct: usize, total: usize) -> Vec<Option<usize>> {
        (0..total)
            .map(|i| if i < correct { Some(0) } else { Some(1) })
            .collect()
    }

    #[test]
    fn test_bucketed_schedule() {
        let quiz = fixtures::quiz(fixtures::bucketed());

        let first = score_attempt(&quiz, &answers(5, 5), 1);
        assert_eq!(first.percentage, 100);
        assert!(first.passed);
        assert_eq!(first.points_earned, 10);

        assert_eq!(score_attempt(&quiz, &answers(5, 5), 2).points_earned, 7);
        assert_eq!(score_attempt(&quiz, &answers(5, 5), 3).points_earned, 5);
        assert_eq!(score_attempt(&quiz, &answers(5, 5), 4).points_earned, 3);
        assert_eq!(score_attempt(&quiz, &answers(5, 5), 5).points_earned, 3);
        assert_eq!(score_attempt(&quiz, &answers(5, 5), 40).points_earned, 3);
    }

    #[test]
    fn test_decayed_second_attempt() {
        let policy = RewardPolicy::Decayed {
            base_points: 20,
            decay_factor: 0.8,
        };

        // 20 * 0.8 * 0.8 = 12.8
        assert_eq!(points_for(&policy, 2, 80, true), 13);
        assert_eq!(points_for(&policy, 1, 100, true), 20);
        assert_eq!(points_for(&policy, 2, 80, false), 0);

        let quiz = fixtures::quiz(policy);
        let score = score_attempt(&quiz, &answers(4, 5), 2);
        assert_eq!(score.raw_score, 4);
        assert_eq!(score.percentage, 80);
        assert!(score.passed);
        assert_eq!(score.points_earned, 13);
    }

    #[test]
    fn test_decayed_failure_pays_nothing() {
        let quiz = fixtures::quiz(RewardPolicy::Decayed {
            base_points: 20,
            decay_factor: 0.8,
        });

        let score = score_attempt(&quiz, &answers(3, 5), 1);
        assert_eq!(score.percentage, 60);
        assert!(!score.passed);
        assert_eq!(score.points_earned, 0);
    }

    #[test]
    fn test_pass_threshold_is_inclusive() {
        let mut quiz = fixtures::quiz(fixtures::bucketed());
        quiz.pass_threshold = 80;

        assert!(score_attempt(&quiz, &answers(4, 5), 1).passed);
        assert!(!score_attempt(&quiz, &answers(3, 5), 1).passed);
    }

    #[test]
    fn test_unanswered_and_invalid_choices_are_wrong() {
        let quiz = fixtures::quiz(fixtures::bucketed());

        let score = score_attempt(&quiz, &[Some(0), None, Some(7)], 1);
        assert_eq!(score.raw_score, 1);
        assert_eq!(score.total_questions, 5);
        assert_eq!(score.percentage, 20);

        let extra = score_attempt(&quiz, &[Some(0); 9], 1);
        assert_eq!(extra.raw_score, 5);
    }

    #[test]
    fn test_percentage_rounds() {
        let mut quiz = fixtures::quiz(fixtures::bucketed());
        quiz.questions.truncate(3);

        // 2/3 = 66.67
        assert_eq!(score_attempt(&quiz, &answers(2, 3), 1).percentage, 67);
    }

    #[test]
    fn test_empty_quiz_fails() {
        let mut quiz = fixtures::quiz(RewardPolicy::Decayed {
            base_points: 20,
            decay_factor: 0.8,
        });
        quiz.questions.clear();

        let score = score_attempt(&quiz, &[], 1);
        assert_eq!(score.percentage, 0);
        assert!(!score.passed);
        assert_eq!(score.points_earned, 0);
    }
}
