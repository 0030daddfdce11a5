use blake3::Hasher;

use super::ast::{self, Program};
use super::ir::{BranchArm, CallSite, Expr, Keyword, ProgramIr, Stmt};
use super::parser::parse_program;
use super::ParseError;

/// Parse and transform routine source into its interceptable IR.
pub fn compile(name: &str, source: &str) -> Result<ProgramIr, ParseError> {
    let program = parse_program(name, source)?;
    Ok(build_ir(&program))
}

/// Transform a parsed program, rewriting every call into an intercepted [`CallSite`].
pub fn build_ir(program: &Program) -> ProgramIr {
    let mut builder = Builder { next_site: 0 };
    let body = builder.lower_block(&program.body);
    ProgramIr {
        name: program.name.clone(),
        digest: program_digest(&program.source),
        body,
        call_sites: builder.next_site,
    }
}

/// Blake3 digest identifying one revision of a program's source text.
pub fn program_digest(source: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(b"encore-program|");
    hasher.update(source.as_bytes());
    hasher.finalize().to_hex().to_string()
}

struct Builder {
    next_site: usize,
}

impl Builder {
    fn lower_block(&mut self, stmts: &[ast::Stmt]) -> Vec<Stmt> {
        stmts.iter().map(|stmt| self.lower_stmt(stmt)).collect()
    }

    fn lower_stmt(&mut self, stmt: &ast::Stmt) -> Stmt {
        match stmt {
            ast::Stmt::Assign(name, value) => Stmt::Assign {
                name: name.clone(),
                value: self.lower_expr(value),
            },
            ast::Stmt::Expr(expr) => Stmt::Expr(self.lower_expr(expr)),
            ast::Stmt::Return(value) => Stmt::Return(value.as_ref().map(|expr| self.lower_expr(expr))),
            ast::Stmt::If { arms, otherwise } => Stmt::If {
                arms: arms
                    .iter()
                    .map(|(condition, body)| BranchArm {
                        condition: self.lower_expr(condition),
                        body: self.lower_block(body),
                    })
                    .collect(),
                otherwise: otherwise.as_ref().map(|body| self.lower_block(body)),
            },
            ast::Stmt::For { var, iter, body } => Stmt::For {
                var: var.clone(),
                iter: self.lower_expr(iter),
                body: self.lower_block(body),
            },
        }
    }

    fn lower_expr(&mut self, expr: &ast::Expr) -> Expr {
        match expr {
            ast::Expr::Literal(value) => Expr::Literal(value.clone()),
            ast::Expr::Name(name) => Expr::Load(name.clone()),
            ast::Expr::List(items) => Expr::List(items.iter().map(|item| self.lower_expr(item)).collect()),
            ast::Expr::Map(entries) => Expr::Map(self.lower_keywords(entries)),
            ast::Expr::Field(target, field) => Expr::Field {
                target: Box::new(self.lower_expr(target)),
                field: field.clone(),
            },
            ast::Expr::Index(target, index) => Expr::Index {
                target: Box::new(self.lower_expr(target)),
                index: Box::new(self.lower_expr(index)),
            },
            ast::Expr::Unary(op, operand) => Expr::Unary {
                op: *op,
                operand: Box::new(self.lower_expr(operand)),
            },
            ast::Expr::Binary(op, lhs, rhs) => Expr::Binary {
                op: *op,
                lhs: Box::new(self.lower_expr(lhs)),
                rhs: Box::new(self.lower_expr(rhs)),
            },
            ast::Expr::Call { name, args, kwargs } => {
                // arguments first so inner calls get the lower site numbers
                let args = args.iter().map(|arg| self.lower_expr(arg)).collect();
                let kwargs = self.lower_keywords(kwargs);
                let site = self.next_site;
                self.next_site += 1;
                Expr::Call(CallSite {
                    site,
                    name: name.clone(),
                    args,
                    kwargs,
                })
            }
        }
    }

    fn lower_keywords(&mut self, entries: &[(String, ast::Expr)]) -> Vec<Keyword> {
        entries
            .iter()
            .map(|(name, value)| Keyword {
                name: name.clone(),
                value: self.lower_expr(value),
            })
            .collect()
    }
}
