// 页面渲染：任务列表与编辑表单，所有用户内容均做 HTML 转义。
use crate::storage::TaskRecord;
use std::fmt::Write;

const STYLESHEET: &str = "/static/css/main.css";

pub fn render_index(tasks: &[TaskRecord]) -> String {
    let mut body = String::new();
    body.push_str("<div class=\"content\">\n<h1>Task Master</h1>\n");
    if tasks.is_empty() {
        body.push_str("<h4 class=\"empty\">There are no tasks. Create one below!</h4>\n");
    } else {
        body.push_str("<table>\n<tr><th>Task</th><th>Added</th><th>Actions</th></tr>\n");
        for task in tasks {
            let _ = writeln!(
                body,
                "<tr><td>{content}</td><td>{added}</td><td><a href=\"/delete/{id}\">Delete</a> <a href=\"/edit/{id}\">Edit</a></td></tr>",
                content = escape_html(&task.content),
                added = task.created_at.format("%Y-%m-%d"),
                id = task.id,
            );
        }
        body.push_str("</table>\n");
    }
    body.push_str(
        "<form action=\"/\" method=\"POST\">\n\
         <input type=\"text\" name=\"content\" id=\"content\" maxlength=\"100\" required>\n\
         <input type=\"submit\" value=\"Add Task\">\n\
         </form>\n</div>\n",
    );
    layout("Task Master", &body)
}

pub fn render_edit(task: &TaskRecord) -> String {
    let mut body = String::new();
    let _ = write!(
        body,
        "<div class=\"content\">\n<h1>Edit Task</h1>\n\
         <form action=\"/edit/{id}\" method=\"POST\">\n\
         <input type=\"text\" name=\"content\" id=\"content\" maxlength=\"100\" value=\"{content}\" required>\n\
         <input type=\"submit\" value=\"Update\">\n\
         </form>\n<a href=\"/\">Back</a>\n</div>\n",
        id = task.id,
        content = escape_html(&task.content),
    );
    layout("Edit Task", &body)
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title}</title>\n<link rel=\"stylesheet\" href=\"{STYLESHEET}\">\n\
         </head>\n<body>\n{body}</body>\n</html>\n",
        title = escape_html(title),
    )
}

pub fn escape_html(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#x27;"),
            _ => output.push(ch),
        }
    }
    output
}
