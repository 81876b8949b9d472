//! Visitors used for redisplay.
//!
//! [`TreeLabeler`] builds the label tree a task view shows. The painting
//! pass-through ([`TaskPainter`], [`draw_tasks`]) hands each leaf task to an
//! external painter together with the caller's drawing surface and scale
//! factor; no drawing happens in this crate.

use super::{MoveToWell, MultiTask, Task, TaskVisitor};

/// Display node for one task and its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLabel {
    /// Text shown for this node
    pub text: String,
    /// Child nodes, in execution order
    pub children: Vec<TaskLabel>,
}

/// Builds a [`TaskLabel`] tree.
#[derive(Debug, Default)]
pub struct TreeLabeler;

impl TaskVisitor for TreeLabeler {
    type Output = TaskLabel;

    fn visit_move_to_well(&mut self, task: &MoveToWell) -> TaskLabel {
        TaskLabel {
            text: task.to_string(),
            children: Vec::new(),
        }
    }

    fn visit_null(&mut self) -> TaskLabel {
        TaskLabel {
            text: "Null task".to_string(),
            children: Vec::new(),
        }
    }

    fn visit_multi(&mut self, task: &MultiTask) -> TaskLabel {
        TaskLabel {
            text: format!("Multi task ({})", task.len()),
            children: task.children().iter().map(|c| c.dispatch(self)).collect(),
        }
    }
}

/// Rendering callbacks supplied by a view.
///
/// `Surface` is whatever the view draws on; the core never looks inside it.
pub trait TaskPainter {
    /// Drawing surface type.
    type Surface: ?Sized;

    /// Paints a move task.
    fn paint_move(&mut self, task: &MoveToWell, surface: &mut Self::Surface, scale: f64);

    /// Paints a null task. Most views draw nothing for it.
    fn paint_null(&mut self, _surface: &mut Self::Surface, _scale: f64) {}
}

struct PaintVisitor<'a, P: TaskPainter + ?Sized> {
    painter: &'a mut P,
    surface: &'a mut P::Surface,
    scale: f64,
}

impl<P: TaskPainter + ?Sized> TaskVisitor for PaintVisitor<'_, P> {
    type Output = ();

    fn visit_move_to_well(&mut self, task: &MoveToWell) {
        self.painter.paint_move(task, &mut *self.surface, self.scale);
    }

    fn visit_null(&mut self) {
        self.painter.paint_null(&mut *self.surface, self.scale);
    }

    fn visit_multi(&mut self, task: &MultiTask) {
        for child in task.children() {
            child.dispatch(self);
        }
    }
}

/// Asks every task, in order, to paint itself through `painter`.
///
/// `scale` is the view's centimeter-to-pixel factor and is passed through
/// untouched.
pub fn draw_tasks<P>(tasks: &[Task], painter: &mut P, surface: &mut P::Surface, scale: f64)
where
    P: TaskPainter + ?Sized,
{
    let mut visitor = PaintVisitor {
        painter,
        surface,
        scale,
    };
    for task in tasks {
        task.dispatch(&mut visitor);
    }
}
