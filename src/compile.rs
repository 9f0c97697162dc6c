use std::iter::Peekable;

use crate::{
    scan, token, FnUpvalue, Gc, Heap, HeapObj, ObjFun, ObjStr, OpCode, ParseError, Position,
    Scanner, Token, Value, MAX_CHUNK_CONSTANTS, MAX_LOCAL_VARIABLES, MAX_PARAMS, MAX_UPVALUES,
};

/// Compile the given source code into a function holding the bytecode of the
/// top-level script.
///
/// Compilation keeps going after an error so several problems can be reported
/// from a single run; the errors are returned in source order.
pub fn compile(src: &str, heap: &mut Heap) -> Result<ObjFun, Vec<ParseError>> {
    let mut parser = Parser::new(heap, src);
    while parser.peek().is_some() {
        if let Err(err) = parser.declaration() {
            parser.errors.push(err);
            parser.synchronize();
        }
    }
    parser.finish()
}

/// What kind of function body the compiler is currently inside of. Return
/// handling and the reserved stack slot 0 depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunKind {
    /// The implicit top-level function
    Script,
    /// A `fun` declaration
    Function,
    /// A method declared in a class body
    Method,
    /// The method named `init`; returns its receiver
    Initializer,
}

/// A local variable known to the compiler.
#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth at initialization; `None` between declaration and
    /// initialization so `var x = x;` can be rejected
    depth: Option<usize>,
    is_captured: bool,
}

/// Per-function compilation state. These form a stack in the parser that
/// mirrors the nesting of function declarations in source.
#[derive(Debug)]
struct FunCompiler {
    fun: ObjFun,
    kind: FunKind,
    locals: Vec<Local>,
    upvalues: Vec<FnUpvalue>,
    scope_depth: usize,
}

impl FunCompiler {
    fn new(name: Option<Gc<ObjStr>>, kind: FunKind) -> Self {
        // Slot 0 belongs to the callee and is unnameable, except in methods
        // where it holds the receiver and is named 'this'.
        let slot_zero = Local {
            name: match kind {
                FunKind::Method | FunKind::Initializer => "this".to_string(),
                FunKind::Script | FunKind::Function => String::new(),
            },
            depth: Some(0),
            is_captured: false,
        };
        Self {
            fun: ObjFun::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Scan for tokens and emit corresponding bytecodes.
#[derive(Debug)]
struct Parser<'a> {
    heap: &'a mut Heap,
    tokens: Peekable<scan::Iter<'a>>,
    compilers: Vec<FunCompiler>,
    class_depth: usize,
    errors: Vec<ParseError>,
    last_pos: Position,
}

impl<'a> Parser<'a> {
    fn new(heap: &'a mut Heap, src: &'a str) -> Self {
        Self {
            heap,
            tokens: Scanner::new(src).into_iter().peekable(),
            compilers: vec![FunCompiler::new(None, FunKind::Script)],
            class_depth: 0,
            errors: Vec::new(),
            last_pos: Position::default(),
        }
    }

    fn finish(mut self) -> Result<ObjFun, Vec<ParseError>> {
        self.emit_return(self.last_pos);
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        let compiler = self
            .compilers
            .pop()
            .expect("The script compiler is never popped before finish.");
        Ok(compiler.fun)
    }

    // ------------------------------------------------------------------
    // Declarations and statements
    // ------------------------------------------------------------------

    fn declaration(&mut self) -> Result<(), ParseError> {
        if self.advance_when(token::Type::Class).is_some() {
            return self.class_declaration();
        }
        if self.advance_when(token::Type::Fun).is_some() {
            return self.fun_declaration();
        }
        if self.advance_when(token::Type::Var).is_some() {
            return self.var_declaration();
        }
        self.statement()
    }

    fn class_declaration(&mut self) -> Result<(), ParseError> {
        let ident = self.consume(token::Type::Ident, "Expect class name")?;
        let name_id = self.identifier_constant(&ident)?;
        self.declare_variable(&ident)?;
        self.emit(OpCode::Class(name_id), ident.pos);
        self.define_variable(name_id, ident.pos);

        self.class_depth += 1;
        let body = self.class_body(&ident);
        self.class_depth -= 1;
        body
    }

    fn class_body(&mut self, class_ident: &Token) -> Result<(), ParseError> {
        // Load the class back on the stack so methods can attach to it.
        self.named_variable(class_ident, false)?;
        self.consume(token::Type::LBrace, "Expect '{' before class body")?;
        while !self.check(token::Type::RBrace) && self.peek().is_some() {
            self.method()?;
        }
        self.consume(token::Type::RBrace, "Expect '}' after class body")?;
        self.emit(OpCode::Pop, class_ident.pos);
        Ok(())
    }

    fn method(&mut self) -> Result<(), ParseError> {
        let ident = self.consume(token::Type::Ident, "Expect method name")?;
        let name_id = self.identifier_constant(&ident)?;
        let kind = if ident.lexeme == "init" {
            FunKind::Initializer
        } else {
            FunKind::Method
        };
        self.function(kind, &ident)?;
        self.emit(OpCode::Method(name_id), ident.pos);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<(), ParseError> {
        let (global_id, ident) = self.parse_variable("Expect function name")?;
        // A function may call itself, so its name is usable before the body
        // is done compiling.
        self.mark_initialized();
        self.function(FunKind::Function, &ident)?;
        self.define_variable(global_id, ident.pos);
        Ok(())
    }

    /// Compile a function body into a fresh compiler, then emit the closure
    /// that builds it at runtime.
    fn function(&mut self, kind: FunKind, name_tok: &Token) -> Result<(), ParseError> {
        let name = self.intern(&name_tok.lexeme);
        self.compilers.push(FunCompiler::new(Some(name), kind));
        let body = self.function_body();
        let compiler = self
            .compilers
            .pop()
            .expect("The function compiler was pushed above.");
        body?;

        let mut fun = compiler.fun;
        fun.upvalue_count = compiler.upvalues.len();
        let fun = self.alloc_fun(fun);
        let const_id = self.make_constant(Value::Fun(fun), name_tok.pos)?;
        self.emit(
            OpCode::Closure(const_id, compiler.upvalues),
            name_tok.pos,
        );
        Ok(())
    }

    fn function_body(&mut self) -> Result<(), ParseError> {
        self.begin_scope();
        self.consume(token::Type::LParen, "Expect '(' after function name")?;
        if !self.check(token::Type::RParen) {
            loop {
                if usize::from(self.current().fun.arity) >= MAX_PARAMS {
                    return Err(ParseError::TooManyParams(self.last_pos));
                }
                self.current_mut().fun.arity += 1;
                let (param_id, param) = self.parse_variable("Expect parameter name")?;
                self.define_variable(param_id, param.pos);
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RParen, "Expect ')' after parameters")?;
        self.consume(token::Type::LBrace, "Expect '{' before function body")?;
        self.block()?;
        self.emit_return(self.last_pos);
        Ok(())
    }

    fn var_declaration(&mut self) -> Result<(), ParseError> {
        let (ident_id, ident) = self.parse_variable("Expect variable name")?;
        if self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil, self.last_pos);
        }
        self.consume(
            token::Type::Semicolon,
            "Expect ';' after variable declaration",
        )?;
        self.define_variable(ident_id, ident.pos);
        Ok(())
    }

    fn statement(&mut self) -> Result<(), ParseError> {
        if let Some(tok) = self.advance_when(token::Type::Print) {
            return self.print_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::If) {
            return self.if_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::While) {
            return self.while_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::For) {
            return self.for_statement(&tok);
        }
        if let Some(tok) = self.advance_when(token::Type::Return) {
            return self.return_statement(&tok);
        }
        if self.advance_when(token::Type::LBrace).is_some() {
            self.begin_scope();
            let body = self.block();
            self.end_scope(self.last_pos);
            return body;
        }
        self.expression_statement()
    }

    fn block(&mut self) -> Result<(), ParseError> {
        while !self.check(token::Type::RBrace) && self.peek().is_some() {
            self.declaration()?;
        }
        self.consume(token::Type::RBrace, "Expect '}' after block")?;
        Ok(())
    }

    fn print_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after value")?;
        self.emit(OpCode::Print, tok.pos);
        Ok(())
    }

    fn if_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.consume(token::Type::LParen, "Expect '(' after 'if'")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after condition")?;

        // Both branch heads pop the condition, so the stack height does not
        // depend on which branch ran.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        self.emit(OpCode::Pop, tok.pos);
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump(u16::MAX), tok.pos);
        self.patch_jump(then_jump, tok.pos)?;
        self.emit(OpCode::Pop, tok.pos);
        if self.advance_when(token::Type::Else).is_some() {
            self.statement()?;
        }
        self.patch_jump(else_jump, tok.pos)?;
        Ok(())
    }

    fn while_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        let loop_start = self.current().fun.chunk.instructions_count();
        self.consume(token::Type::LParen, "Expect '(' after 'while'")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after condition")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        self.emit(OpCode::Pop, tok.pos);
        self.statement()?;
        self.emit_loop(loop_start, tok.pos)?;
        self.patch_jump(exit_jump, tok.pos)?;
        self.emit(OpCode::Pop, tok.pos);
        Ok(())
    }

    fn for_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.begin_scope();
        let body = self.for_statement_body(tok);
        self.end_scope(self.last_pos);
        body
    }

    fn for_statement_body(&mut self, tok: &Token) -> Result<(), ParseError> {
        self.consume(token::Type::LParen, "Expect '(' after 'for'")?;
        if self.advance_when(token::Type::Semicolon).is_some() {
            // no initializer
        } else if self.advance_when(token::Type::Var).is_some() {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current().fun.chunk.instructions_count();
        let mut exit_jump = None;
        if self.advance_when(token::Type::Semicolon).is_none() {
            self.expression()?;
            self.consume(token::Type::Semicolon, "Expect ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos));
            self.emit(OpCode::Pop, tok.pos);
        }

        if self.advance_when(token::Type::RParen).is_none() {
            // The increment clause runs after the body, so jump over it going
            // in and loop back to it coming out.
            let body_jump = self.emit_jump(OpCode::Jump(u16::MAX), tok.pos);
            let increment_start = self.current().fun.chunk.instructions_count();
            self.expression()?;
            self.emit(OpCode::Pop, tok.pos);
            self.consume(token::Type::RParen, "Expect ')' after for clauses")?;
            self.emit_loop(loop_start, tok.pos)?;
            loop_start = increment_start;
            self.patch_jump(body_jump, tok.pos)?;
        }

        self.statement()?;
        self.emit_loop(loop_start, tok.pos)?;
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, tok.pos)?;
            self.emit(OpCode::Pop, tok.pos);
        }
        Ok(())
    }

    fn return_statement(&mut self, tok: &Token) -> Result<(), ParseError> {
        if self.current().kind == FunKind::Script {
            return Err(ParseError::ReturnFromScript(tok.pos));
        }
        if self.advance_when(token::Type::Semicolon).is_some() {
            self.emit_return(tok.pos);
            return Ok(());
        }
        if self.current().kind == FunKind::Initializer {
            return Err(ParseError::ReturnFromInitializer(tok.pos));
        }
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after return value")?;
        self.emit(OpCode::Return, tok.pos);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after expression")?;
        self.emit(OpCode::Pop, self.last_pos);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), ParseError> {
        let can_assign = precedence <= Precedence::Assignment;
        let tok = self.advance()?;
        self.prefix_rule(&tok, can_assign)?;

        loop {
            match self.peek() {
                None => break,
                Some(tok) if precedence > Precedence::of(&tok.typ) => break,
                _ => {}
            }
            let tok = self.advance()?;
            self.infix_rule(&tok, can_assign)?;
        }

        if can_assign {
            if let Some(equal) = self.advance_when(token::Type::Equal) {
                return Err(ParseError::InvalidAssignment(equal.pos));
            }
        }
        Ok(())
    }

    fn prefix_rule(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        match tok.typ {
            token::Type::LParen => self.grouping(),
            token::Type::Minus | token::Type::Bang => self.unary(tok),
            token::Type::String => self.string(tok),
            token::Type::Number => self.number(tok),
            token::Type::Ident => self.named_variable(tok, can_assign),
            token::Type::This => self.this_(tok),
            token::Type::False | token::Type::Nil | token::Type::True => self.literal(tok),
            _ => Err(ParseError::UnexpectedToken(
                tok.pos,
                Some(tok.lexeme.to_string()),
                "Expect expression".to_string(),
            )),
        }
    }

    fn infix_rule(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        match tok.typ {
            token::Type::Minus
            | token::Type::Plus
            | token::Type::Slash
            | token::Type::Star
            | token::Type::BangEqual
            | token::Type::EqualEqual
            | token::Type::Greater
            | token::Type::GreaterEqual
            | token::Type::Less
            | token::Type::LessEqual => self.binary(tok),
            token::Type::LParen => self.call(tok),
            token::Type::Dot => self.dot(tok, can_assign),
            token::Type::And => self.and_(tok),
            token::Type::Or => self.or_(tok),
            _ => Err(ParseError::UnexpectedToken(
                tok.pos,
                Some(tok.lexeme.to_string()),
                "Expect expression".to_string(),
            )),
        }
    }

    fn binary(&mut self, operator: &Token) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::of(&operator.typ).next())?;
        match operator.typ {
            token::Type::BangEqual => {
                self.emit(OpCode::Equal, operator.pos);
                self.emit(OpCode::Not, operator.pos);
            }
            token::Type::EqualEqual => self.emit(OpCode::Equal, operator.pos),
            token::Type::Greater => self.emit(OpCode::Greater, operator.pos),
            token::Type::GreaterEqual => {
                self.emit(OpCode::Less, operator.pos);
                self.emit(OpCode::Not, operator.pos);
            }
            token::Type::Less => self.emit(OpCode::Less, operator.pos),
            token::Type::LessEqual => {
                self.emit(OpCode::Greater, operator.pos);
                self.emit(OpCode::Not, operator.pos);
            }
            token::Type::Plus => self.emit(OpCode::Add, operator.pos),
            token::Type::Minus => self.emit(OpCode::Subtract, operator.pos),
            token::Type::Star => self.emit(OpCode::Multiply, operator.pos),
            token::Type::Slash => self.emit(OpCode::Divide, operator.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn unary(&mut self, operator: &Token) -> Result<(), ParseError> {
        self.parse_precedence(Precedence::Unary)?;
        match operator.typ {
            token::Type::Bang => self.emit(OpCode::Not, operator.pos),
            token::Type::Minus => self.emit(OpCode::Negate, operator.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn call(&mut self, tok: &Token) -> Result<(), ParseError> {
        let argc = self.argument_list()?;
        self.emit(OpCode::Call(argc), tok.pos);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ParseError> {
        let mut argc = 0usize;
        if !self.check(token::Type::RParen) {
            loop {
                if argc >= MAX_PARAMS {
                    return Err(ParseError::TooManyArgs(self.last_pos));
                }
                self.expression()?;
                argc += 1;
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RParen, "Expect ')' after arguments")?;
        Ok(argc as u8)
    }

    fn dot(&mut self, tok: &Token, can_assign: bool) -> Result<(), ParseError> {
        let ident = self.consume(token::Type::Ident, "Expect property name after '.'")?;
        let name_id = self.identifier_constant(&ident)?;
        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(OpCode::SetProperty(name_id), tok.pos);
        } else {
            self.emit(OpCode::GetProperty(name_id), tok.pos);
        }
        Ok(())
    }

    fn and_(&mut self, tok: &Token) -> Result<(), ParseError> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        self.emit(OpCode::Pop, tok.pos);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump, tok.pos)?;
        Ok(())
    }

    fn or_(&mut self, tok: &Token) -> Result<(), ParseError> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX), tok.pos);
        let end_jump = self.emit_jump(OpCode::Jump(u16::MAX), tok.pos);
        self.patch_jump(else_jump, tok.pos)?;
        self.emit(OpCode::Pop, tok.pos);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump, tok.pos)?;
        Ok(())
    }

    fn this_(&mut self, tok: &Token) -> Result<(), ParseError> {
        if self.class_depth == 0 {
            return Err(ParseError::ThisOutsideClass(tok.pos));
        }
        self.named_variable(tok, false)
    }

    fn grouping(&mut self) -> Result<(), ParseError> {
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after expression")?;
        Ok(())
    }

    fn literal(&mut self, tok: &Token) -> Result<(), ParseError> {
        match tok.typ {
            token::Type::False => self.emit(OpCode::False, tok.pos),
            token::Type::Nil => self.emit(OpCode::Nil, tok.pos),
            token::Type::True => self.emit(OpCode::True, tok.pos),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn string(&mut self, tok: &Token) -> Result<(), ParseError> {
        let value = tok.lexeme[1..tok.lexeme.len() - 1].to_string();
        let value = Value::Str(self.intern(&value));
        let const_id = self.make_constant(value, tok.pos)?;
        self.emit(OpCode::Constant(const_id), tok.pos);
        Ok(())
    }

    fn number(&mut self, tok: &Token) -> Result<(), ParseError> {
        let value = tok
            .lexeme
            .parse()
            .expect("Scanner must ensure that the lexeme contains a valid f64 string.");
        let const_id = self.make_constant(Value::Number(value), tok.pos)?;
        self.emit(OpCode::Constant(const_id), tok.pos);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variable resolution
    // ------------------------------------------------------------------

    /// Consume a variable name and declare it in the current scope. Returns
    /// the constant holding the name when the variable is global, along with
    /// the name token.
    fn parse_variable(&mut self, msg: &str) -> Result<(u8, Token), ParseError> {
        let ident = self.consume(token::Type::Ident, msg)?;
        self.declare_variable(&ident)?;
        if self.current().scope_depth > 0 {
            return Ok((0, ident));
        }
        let ident_id = self.identifier_constant(&ident)?;
        Ok((ident_id, ident))
    }

    fn declare_variable(&mut self, ident: &Token) -> Result<(), ParseError> {
        let compiler = self.current();
        if compiler.scope_depth == 0 {
            return Ok(());
        }
        for local in compiler.locals.iter().rev() {
            if matches!(local.depth, Some(depth) if depth < compiler.scope_depth) {
                break;
            }
            if local.name == ident.lexeme {
                return Err(ParseError::DuplicateVariable(
                    ident.pos,
                    ident.lexeme.clone(),
                ));
            }
        }
        self.add_local(ident)
    }

    fn add_local(&mut self, ident: &Token) -> Result<(), ParseError> {
        let compiler = self.current_mut();
        if compiler.locals.len() >= MAX_LOCAL_VARIABLES {
            return Err(ParseError::TooManyLocals(ident.pos));
        }
        compiler.locals.push(Local {
            name: ident.lexeme.clone(),
            depth: None,
            is_captured: false,
        });
        Ok(())
    }

    fn define_variable(&mut self, ident_id: u8, pos: Position) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(OpCode::DefineGlobal(ident_id), pos);
    }

    fn mark_initialized(&mut self) {
        let compiler = self.current_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        compiler
            .locals
            .last_mut()
            .expect("A local was just declared.")
            .depth = Some(depth);
    }

    fn named_variable(&mut self, ident: &Token, can_assign: bool) -> Result<(), ParseError> {
        let compiler_idx = self.compilers.len() - 1;
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(compiler_idx, ident)? {
            (OpCode::GetLocal(slot), OpCode::SetLocal(slot))
        } else if let Some(idx) = self.resolve_upvalue(compiler_idx, ident)? {
            (OpCode::GetUpvalue(idx), OpCode::SetUpvalue(idx))
        } else {
            let ident_id = self.identifier_constant(ident)?;
            (OpCode::GetGlobal(ident_id), OpCode::SetGlobal(ident_id))
        };

        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(set_op, ident.pos);
        } else {
            self.emit(get_op, ident.pos);
        }
        Ok(())
    }

    fn resolve_local(
        &self,
        compiler_idx: usize,
        ident: &Token,
    ) -> Result<Option<u8>, ParseError> {
        let compiler = &self.compilers[compiler_idx];
        for (slot, local) in compiler.locals.iter().enumerate().rev() {
            if local.name == ident.lexeme {
                if local.depth.is_none() {
                    return Err(ParseError::OwnInitializer(
                        ident.pos,
                        ident.lexeme.clone(),
                    ));
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    /// Find the variable in an enclosing function and thread it through every
    /// compiler in between as an upvalue. Returns the upvalue index in the
    /// compiler at `compiler_idx`.
    fn resolve_upvalue(
        &mut self,
        compiler_idx: usize,
        ident: &Token,
    ) -> Result<Option<u8>, ParseError> {
        if compiler_idx == 0 {
            return Ok(None);
        }
        if let Some(slot) = self.resolve_local(compiler_idx - 1, ident)? {
            self.compilers[compiler_idx - 1].locals[usize::from(slot)].is_captured = true;
            let upvalue = FnUpvalue {
                index: slot,
                is_local: true,
            };
            return Ok(Some(self.add_upvalue(compiler_idx, upvalue, ident.pos)?));
        }
        if let Some(idx) = self.resolve_upvalue(compiler_idx - 1, ident)? {
            let upvalue = FnUpvalue {
                index: idx,
                is_local: false,
            };
            return Ok(Some(self.add_upvalue(compiler_idx, upvalue, ident.pos)?));
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        compiler_idx: usize,
        upvalue: FnUpvalue,
        pos: Position,
    ) -> Result<u8, ParseError> {
        let upvalues = &mut self.compilers[compiler_idx].upvalues;
        for (idx, existing) in upvalues.iter().enumerate() {
            if *existing == upvalue {
                return Ok(idx as u8);
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            return Err(ParseError::TooManyUpvalues(pos));
        }
        upvalues.push(upvalue);
        Ok((upvalues.len() - 1) as u8)
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    fn end_scope(&mut self, pos: Position) {
        self.current_mut().scope_depth -= 1;
        loop {
            let compiler = self.current_mut();
            let scope_depth = compiler.scope_depth;
            let dying = matches!(
                compiler.locals.last(),
                Some(local) if matches!(local.depth, Some(depth) if depth > scope_depth)
            );
            if !dying {
                break;
            }
            let local = compiler
                .locals
                .pop()
                .expect("The loop condition checked the local.");
            // A captured slot must outlive its scope; promote it to a closed
            // upvalue instead of discarding it.
            let op = if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit(op, pos);
        }
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn emit(&mut self, op: OpCode, pos: Position) {
        self.current_mut().fun.chunk.write_instruction(op, pos);
    }

    fn emit_return(&mut self, pos: Position) {
        // Initializers return their receiver from the reserved slot.
        if self.current().kind == FunKind::Initializer {
            self.emit(OpCode::GetLocal(0), pos);
        } else {
            self.emit(OpCode::Nil, pos);
        }
        self.emit(OpCode::Return, pos);
    }

    fn emit_jump(&mut self, op: OpCode, pos: Position) -> usize {
        self.emit(op, pos);
        self.current().fun.chunk.instructions_count() - 1
    }

    fn patch_jump(&mut self, jump: usize, pos: Position) -> Result<(), ParseError> {
        let offset = self.current().fun.chunk.instructions_count() - jump - 1;
        let offset = u16::try_from(offset).map_err(|_| ParseError::JumpTooLarge(pos))?;
        self.current_mut()
            .fun
            .chunk
            .patch_jump_instruction(jump, offset);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, pos: Position) -> Result<(), ParseError> {
        let offset = self.current().fun.chunk.instructions_count() - loop_start + 1;
        let offset = u16::try_from(offset).map_err(|_| ParseError::LoopTooLarge(pos))?;
        self.emit(OpCode::Loop(offset), pos);
        Ok(())
    }

    fn make_constant(&mut self, value: Value, pos: Position) -> Result<u8, ParseError> {
        let chunk = &mut self.current_mut().fun.chunk;
        if chunk.const_count() >= MAX_CHUNK_CONSTANTS {
            return Err(ParseError::TooManyConstants(pos));
        }
        Ok(chunk.write_const(value) as u8)
    }

    fn identifier_constant(&mut self, ident: &Token) -> Result<u8, ParseError> {
        let name = self.intern(&ident.lexeme);
        self.make_constant(Value::Str(name), ident.pos)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Intern a string, collecting first when the heap asks for it. The
    /// compiler's roots are the constants of every function still being
    /// compiled.
    fn intern(&mut self, s: &str) -> Gc<ObjStr> {
        if self.heap.should_collect() {
            self.mark_roots();
            self.heap.collect();
        }
        self.heap.intern(s)
    }

    fn alloc_fun(&mut self, fun: ObjFun) -> Gc<ObjFun> {
        let kind = fun.into_kind();
        if self.heap.should_collect() {
            self.mark_roots();
            self.heap.mark_children_of(&kind);
            self.heap.collect();
        }
        self.heap.alloc_kind(kind)
    }

    fn mark_roots(&mut self) {
        for compiler in &self.compilers {
            if let Some(name) = compiler.fun.name {
                self.heap.mark(name);
            }
            for &constant in compiler.fun.chunk.constants() {
                self.heap.mark_value(constant);
            }
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    /// Skip tokens until a statement boundary, so one syntax error does not
    /// cause a cascade of follow-up reports.
    fn synchronize(&mut self) {
        while self.peek().is_some() {
            let tok = self.advance().expect("We have peeked.");
            if tok.typ == token::Type::Semicolon {
                return;
            }
            if let Some(tok) = self.peek() {
                match tok.typ {
                    token::Type::Class
                    | token::Type::Fun
                    | token::Type::Var
                    | token::Type::For
                    | token::Type::If
                    | token::Type::While
                    | token::Type::Print
                    | token::Type::Return => return,
                    _ => {}
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        while let Some(Err(err)) = self.tokens.peek() {
            let err = err.clone();
            self.errors.push(err.into());
            self.tokens.next();
        }
        self.tokens
            .next()
            .map(|tok| {
                let tok = tok.expect("All errors have been skipped.");
                self.last_pos = tok.pos;
                tok
            })
            .ok_or_else(|| {
                ParseError::UnexpectedToken(self.last_pos, None, "Expect expression".to_string())
            })
    }

    fn advance_when(&mut self, typ: token::Type) -> Option<Token> {
        if let Some(tok) = self.peek() {
            if tok.typ == typ {
                return Some(self.advance().expect("We have peeked."));
            }
        }
        None
    }

    fn check(&mut self, typ: token::Type) -> bool {
        matches!(self.peek(), Some(tok) if tok.typ == typ)
    }

    fn peek(&mut self) -> Option<&Token> {
        while let Some(Err(err)) = self.tokens.peek() {
            let err = err.clone();
            self.errors.push(err.into());
            self.tokens.next();
        }
        self.tokens.peek().map(|peeked| match peeked {
            Err(_) => unreachable!("Errors should have been skipped."),
            Ok(tok) => tok,
        })
    }

    fn consume(&mut self, typ: token::Type, msg: &str) -> Result<Token, ParseError> {
        match self.peek() {
            Some(tok) if tok.typ == typ => Ok(self.advance().expect("We have peeked.")),
            Some(tok) => Err(ParseError::UnexpectedToken(
                tok.pos,
                Some(tok.lexeme.to_string()),
                msg.to_string(),
            )),
            None => Err(ParseError::UnexpectedToken(
                self.last_pos,
                None,
                msg.to_string(),
            )),
        }
    }

    fn current(&self) -> &FunCompiler {
        self.compilers
            .last()
            .expect("The compiler stack is never empty.")
    }

    fn current_mut(&mut self) -> &mut FunCompiler {
        self.compilers
            .last_mut()
            .expect("The compiler stack is never empty.")
    }
}

/// All precedence levels in Perch
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    /// No precedence
    None,
    /// Operator `=`
    Assignment,
    /// Operator `or`
    Or,
    /// Operator `and`
    And,
    /// Operator `==` `!=`
    Equality,
    /// Operator `<` `>` `<=` `>=`
    Comparison,
    /// Operator `+` `-`
    Term,
    /// Operator `*` `/`
    Factor,
    /// Operator `!` `-`
    Unary,
    /// Operator `.` `()`
    Call,
    /// Literal and keywords
    Primary,
}

impl Precedence {
    /// Get the immediately higher precedence level
    fn next(&self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }

    fn of(typ: &token::Type) -> Self {
        match typ {
            token::Type::BangEqual | token::Type::EqualEqual => Precedence::Equality,
            token::Type::Greater
            | token::Type::GreaterEqual
            | token::Type::Less
            | token::Type::LessEqual => Precedence::Comparison,
            token::Type::Minus | token::Type::Plus => Precedence::Term,
            token::Type::Slash | token::Type::Star => Precedence::Factor,
            token::Type::LParen | token::Type::Dot => Precedence::Call,
            token::Type::And => Precedence::And,
            token::Type::Or => Precedence::Or,
            _ => Self::None,
        }
    }
}
